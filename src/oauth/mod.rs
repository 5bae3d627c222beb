//! OAuth federation: provider adapter, outer-state handling, callback
//! orchestration, linking/sign-up policy, and grant-code exchange.

pub mod callback;
pub mod error;
pub mod grant;
pub mod provider;
pub mod redirect;
pub mod resolver;
pub mod storage;
pub mod types;

pub const DEFAULT_GRANT_CODE_TTL_SECONDS: i64 = 5 * 60;

/// Runtime configuration of the OAuth flow.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    base_url: String,
    grant_code_ttl_seconds: i64,
    access_token_ttl_seconds: i64,
}

impl OAuthConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            grant_code_ttl_seconds: DEFAULT_GRANT_CODE_TTL_SECONDS,
            access_token_ttl_seconds: crate::tokens::DEFAULT_ACCESS_TOKEN_TTL_SECONDS,
        }
    }

    #[must_use]
    pub const fn with_grant_code_ttl_seconds(mut self, seconds: i64) -> Self {
        self.grant_code_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub const fn with_access_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub const fn grant_code_ttl_seconds(&self) -> i64 {
        self.grant_code_ttl_seconds
    }

    #[must_use]
    pub const fn access_token_ttl_seconds(&self) -> i64 {
        self.access_token_ttl_seconds
    }

    /// Our own callback URL for a provider, replayed as `redirect_uri` in
    /// the provider exchange.
    #[must_use]
    pub fn callback_url(&self, provider_id: &str) -> String {
        format!("{}/v1/auth/oauth/callback/{provider_id}", self.base_url)
    }
}
