//! Command-line argument dispatch and server initialization.
//!
//! This module parses validated CLI arguments and maps them to the appropriate
//! action, such as starting the API server with its full configuration state.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::oauth;
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let oauth_opts = oauth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        base_url: oauth_opts.base_url,
        access_token_key_path: oauth_opts.access_token_key_path,
        access_token_kid: oauth_opts.access_token_kid,
        grant_code_ttl_seconds: oauth_opts.grant_code_ttl_seconds,
        access_token_ttl_seconds: oauth_opts.access_token_ttl_seconds,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_required() {
        temp_env::with_vars(
            [
                ("FEDERATO_BASE_URL", None::<&str>),
                (
                    "FEDERATO_DSN",
                    Some("postgres://user@localhost:5432/federato"),
                ),
                (
                    "FEDERATO_ACCESS_TOKEN_KEY",
                    Some("/tmp/federato-signing-key.pem"),
                ),
            ],
            || {
                let command = crate::cli::commands::new();
                let matches = command.get_matches_from(vec!["federato"]);
                let result = handler(&matches);
                assert!(result.is_err());
                if let Err(err) = result {
                    assert!(
                        err.to_string()
                            .contains("missing required argument: --base-url")
                    );
                }
            },
        );
    }

    #[test]
    fn access_token_key_required() {
        temp_env::with_vars(
            [
                ("FEDERATO_BASE_URL", Some("https://auth.federato.dev")),
                ("FEDERATO_ACCESS_TOKEN_KEY", None::<&str>),
                (
                    "FEDERATO_DSN",
                    Some("postgres://user@localhost:5432/federato"),
                ),
            ],
            || {
                let command = crate::cli::commands::new();
                let matches = command.get_matches_from(vec!["federato"]);
                let result = handler(&matches);
                assert!(result.is_err());
                if let Err(err) = result {
                    assert!(
                        err.to_string()
                            .contains("missing required argument: --access-token-key")
                    );
                }
            },
        );
    }

    #[test]
    fn server_action_carries_options() {
        temp_env::with_vars(
            [
                ("FEDERATO_BASE_URL", Some("https://auth.federato.dev")),
                (
                    "FEDERATO_ACCESS_TOKEN_KEY",
                    Some("/tmp/federato-signing-key.pem"),
                ),
                (
                    "FEDERATO_DSN",
                    Some("postgres://user@localhost:5432/federato"),
                ),
                ("FEDERATO_PORT", Some("9000")),
                ("FEDERATO_GRANT_CODE_TTL_SECONDS", Some("120")),
            ],
            || {
                let command = crate::cli::commands::new();
                let matches = command.get_matches_from(vec!["federato"]);
                let result = handler(&matches);
                assert!(result.is_ok());
                if let Ok(Action::Server(args)) = result {
                    assert_eq!(args.port, 9000);
                    assert_eq!(args.base_url, "https://auth.federato.dev");
                    assert_eq!(args.access_token_kid, "k1");
                    assert_eq!(args.grant_code_ttl_seconds, 120);
                }
            },
        );
    }
}
