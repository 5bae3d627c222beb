//! Tenancy resolution.
//!
//! A tenancy is a (project, branch) pair and the isolation boundary for
//! everything else: users, OAuth accounts, tokens, and provider
//! configuration all hang off a tenancy id.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::{info_span, Instrument};
use uuid::Uuid;

/// Providers the federation layer knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Github,
    Google,
    Microsoft,
    Gitlab,
}

impl ProviderKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Google => "google",
            Self::Microsoft => "microsoft",
            Self::Gitlab => "gitlab",
        }
    }
}

/// Per-tenancy OAuth provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Tenancy-scoped provider id used in callback URLs ("github", "google-2", ...).
    pub id: String,
    pub kind: ProviderKind,
    pub enabled: bool,
    pub client_id: String,
    pub client_secret: String,
    /// Extra scopes requested on top of the provider defaults.
    #[serde(default)]
    pub scope: Option<String>,
}

/// A resolved tenancy with the configuration the OAuth flow needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenancy {
    pub id: Uuid,
    /// Root project id, also the audience of issued access tokens.
    pub project_id: String,
    pub branch_id: String,
    pub display_name: String,
    /// Trusted domains for redirect validation, e.g. `https://app.example.com`.
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub allow_localhost: bool,
    pub sign_up_enabled: bool,
    #[serde(default)]
    pub oauth_providers: Vec<ProviderConfig>,
}

impl Tenancy {
    /// Look up an enabled provider by its tenancy-scoped id.
    #[must_use]
    pub fn enabled_provider(&self, provider_id: &str) -> Option<&ProviderConfig> {
        self.oauth_providers
            .iter()
            .find(|p| p.id == provider_id && p.enabled)
    }

    #[cfg(test)]
    #[must_use]
    pub fn test_fixture() -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: "project-123".to_string(),
            branch_id: "main".to_string(),
            display_name: "Test Project".to_string(),
            domains: vec!["https://app.example.com".to_string()],
            allow_localhost: false,
            sign_up_enabled: true,
            oauth_providers: vec![ProviderConfig {
                id: "github".to_string(),
                kind: ProviderKind::Github,
                enabled: true,
                client_id: "client-id".to_string(),
                client_secret: "client-secret".to_string(),
                scope: None,
            }],
        }
    }
}

/// Load a tenancy by id.
///
/// Returns `Ok(None)` when the tenancy does not exist.
///
/// # Errors
///
/// Returns an error if the query fails or the stored configuration columns
/// do not deserialize.
pub async fn get_tenancy(pool: &PgPool, tenancy_id: Uuid) -> Result<Option<Tenancy>> {
    let query = r"
        SELECT id, project_id, branch_id, display_name, domains,
               allow_localhost, sign_up_enabled, oauth_providers
        FROM tenancies
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(tenancy_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .with_context(|| format!("failed to load tenancy {tenancy_id}"))?;

    let Some(row) = row else {
        return Ok(None);
    };

    let domains: serde_json::Value = row.get("domains");
    let oauth_providers: serde_json::Value = row.get("oauth_providers");
    Ok(Some(Tenancy {
        id: row.get("id"),
        project_id: row.get("project_id"),
        branch_id: row.get("branch_id"),
        display_name: row.get("display_name"),
        domains: serde_json::from_value(domains)
            .with_context(|| format!("invalid domains config for tenancy {tenancy_id}"))?,
        allow_localhost: row.get("allow_localhost"),
        sign_up_enabled: row.get("sign_up_enabled"),
        oauth_providers: serde_json::from_value(oauth_providers)
            .with_context(|| format!("invalid provider config for tenancy {tenancy_id}"))?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ProviderKind::Github).unwrap();
        assert_eq!(json, "\"github\"");
        let kind: ProviderKind = serde_json::from_str("\"google\"").unwrap();
        assert_eq!(kind, ProviderKind::Google);
    }

    #[test]
    fn enabled_provider_skips_disabled_entries() {
        let mut tenancy = Tenancy::test_fixture();
        tenancy.oauth_providers.push(ProviderConfig {
            id: "google".to_string(),
            kind: ProviderKind::Google,
            enabled: false,
            client_id: "x".to_string(),
            client_secret: "y".to_string(),
            scope: None,
        });

        assert!(tenancy.enabled_provider("github").is_some());
        assert!(tenancy.enabled_provider("google").is_none());
        assert!(tenancy.enabled_provider("missing").is_none());
    }

    #[test]
    fn provider_config_deserializes_without_scope() {
        let json = r#"{
            "id": "github",
            "kind": "github",
            "enabled": true,
            "client_id": "abc",
            "client_secret": "def"
        }"#;
        let config: ProviderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.scope, None);
        assert!(config.enabled);
    }
}
