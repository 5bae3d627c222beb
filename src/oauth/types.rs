//! Core OAuth flow types shared between the orchestrator, storage, and API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What the pending flow was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowType {
    /// Sign an end user in (or up, policy permitting).
    Authenticate,
    /// Attach a new federated identity to an already signed-in user.
    Link,
}

/// Server-side record of one pending OAuth attempt, created when the flow
/// begins and keyed by the opaque `inner_state` value.
///
/// Stored as a JSON blob; a row that fails to deserialize into this shape is
/// data corruption and surfaces as an assertion error, never as user input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OuterOAuthState {
    pub inner_state: String,
    pub tenancy_id: Uuid,
    #[serde(rename = "type")]
    pub flow: FlowType,
    /// Present iff `flow == Link`.
    #[serde(default)]
    pub project_user_id: Option<Uuid>,
    /// Scopes requested from the third-party provider.
    #[serde(default)]
    pub provider_scope: Option<String>,
    #[serde(default)]
    pub error_redirect_url: Option<String>,
    #[serde(default)]
    pub after_callback_redirect_url: Option<String>,
    /// PKCE verifier for the provider-side exchange.
    pub inner_code_verifier: String,
    /// Fields of the tenant application's own authorization request, replayed
    /// at redirect-emission time.
    pub redirect_uri: String,
    pub scope: String,
    pub state: String,
    pub grant_type: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub response_type: String,
    pub publishable_client_key: String,
    pub expires_at: DateTime<Utc>,
}

/// Raw outer-state row before schema validation.
#[derive(Debug, Clone)]
pub struct OuterStateRow {
    pub info: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

/// Normalized identity returned by a provider's userinfo endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthUserInfo {
    pub account_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

/// Provider tokens obtained from the code exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub access_token_expired_at: Option<DateTime<Utc>>,
}

/// Uniform result of a provider callback exchange.
#[derive(Debug, Clone)]
pub struct ProviderCallback {
    pub user_info: OAuthUserInfo,
    pub token_set: OAuthTokenSet,
}

/// Binding between a local user and a third-party provider identity.
/// Unique per (tenancy, provider, provider account).
#[derive(Debug, Clone)]
pub struct FederatedAccount {
    pub tenancy_id: Uuid,
    pub provider_id: String,
    pub provider_account_id: String,
    pub user_id: Uuid,
    pub email: Option<String>,
}

/// Local user as the orchestrator sees it.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub tenancy_id: Uuid,
    pub primary_email: Option<String>,
    pub primary_email_auth_enabled: bool,
}

/// Data for a user created through OAuth sign-up.
#[derive(Debug, Clone)]
pub struct NewFederatedUser {
    pub primary_email: Option<String>,
    pub primary_email_verified: bool,
    pub primary_email_auth_enabled: bool,
    pub display_name: Option<String>,
    pub profile_image_url: Option<String>,
}

/// Append-only provider token bookkeeping written on every successful branch.
#[derive(Debug, Clone)]
pub struct ProviderTokenRecord {
    pub tenancy_id: Uuid,
    pub provider_id: String,
    pub provider_account_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scopes: Vec<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
}

/// Single-use authorization grant handed back to the tenant application,
/// later exchanged (with PKCE) for the token pair.
#[derive(Debug, Clone)]
pub struct GrantCode {
    pub code: String,
    pub tenancy_id: Uuid,
    pub user_id: Uuid,
    pub new_user: bool,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub after_callback_redirect_url: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Split a raw scope string into deduplicated scope tokens, preserving order.
#[must_use]
pub fn extract_scopes(raw: &str) -> Vec<String> {
    let mut scopes = Vec::new();
    for token in raw.split_whitespace() {
        if !scopes.iter().any(|s| s == token) {
            scopes.push(token.to_string());
        }
    }
    scopes
}
