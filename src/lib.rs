//! # Federato (Multi-tenant OAuth Federation & Token Issuance)
//!
//! `federato` is the authentication backend that brokers third-party OAuth
//! sign-in for tenant applications and exchanges the result into its own
//! signed access/refresh token pair.
//!
//! ## Tenant Model
//!
//! A tenancy (project + branch) is the isolation boundary. Each tenancy owns
//! its enabled OAuth providers, its redirect-domain allowlist, and its
//! sign-up policy. Every token, user, and OAuth record carries a tenancy id;
//! cross-tenant references are forbidden.
//!
//! ## OAuth callback flow
//!
//! A sign-in or account-link attempt is recorded server-side as an *outer
//! state* row keyed by an opaque inner-state value, paired with a single-use
//! browser cookie. The callback endpoint consumes the cookie, loads and
//! validates the outer state, exchanges the provider code, resolves the
//! federated identity into link / sign-in / sign-up, and redirects back to
//! the tenant application with a single-use grant code. The grant code is
//! then exchanged (with PKCE) for the access/refresh token pair.
//!
//! ## Error model
//!
//! Known flow errors (timeouts, disabled providers, denied consent, linking
//! conflicts) redirect back to the tenant's error page only when that URL
//! validates against the tenancy's domain allowlist; everything else is a
//! hard failure surfaced to operators.

pub mod api;
pub mod cli;
pub mod oauth;
pub mod tenancy;
pub mod tokens;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
