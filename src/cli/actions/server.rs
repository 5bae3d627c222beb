use crate::api::{self, handlers::oauth::FederationState};
use crate::oauth::{provider::HttpProviderExchange, OAuthConfig};
use crate::tokens::AccessTokenKey;
use anyhow::{Context, Result};
use std::{fs, sync::Arc};
use tracing::debug;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub base_url: String,
    pub access_token_key_path: String,
    pub access_token_kid: String,
    pub grant_code_ttl_seconds: i64,
    pub access_token_ttl_seconds: i64,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the signing key cannot be loaded or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let key_bytes = fs::read(&args.access_token_key_path).with_context(|| {
        format!(
            "Failed to read access token signing key: {}",
            args.access_token_key_path
        )
    })?;
    let key = AccessTokenKey::from_pem_or_der(&key_bytes, args.access_token_kid)
        .context("Invalid access token signing key")?;

    let config = OAuthConfig::new(args.base_url)
        .with_grant_code_ttl_seconds(args.grant_code_ttl_seconds)
        .with_access_token_ttl_seconds(args.access_token_ttl_seconds);

    let exchange = HttpProviderExchange::new().context("Failed to build provider HTTP client")?;

    debug!(
        base_url = config.base_url(),
        kid = key.kid(),
        "starting OAuth federation server"
    );

    let federation = Arc::new(FederationState {
        config,
        key,
        exchange,
    });

    api::new(args.port, args.dsn, federation).await
}
