use crate::{oauth::DEFAULT_GRANT_CODE_TTL_SECONDS, tokens::DEFAULT_ACCESS_TOKEN_TTL_SECONDS};
use anyhow::{Context, Result};
use clap::{Arg, Command};

pub const ARG_BASE_URL: &str = "base-url";
pub const ARG_ACCESS_TOKEN_KEY: &str = "access-token-key";
pub const ARG_ACCESS_TOKEN_KID: &str = "access-token-kid";
pub const ARG_GRANT_CODE_TTL_SECONDS: &str = "grant-code-ttl-seconds";
pub const ARG_ACCESS_TOKEN_TTL_SECONDS: &str = "access-token-ttl-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_BASE_URL)
                .long(ARG_BASE_URL)
                .help("Public base URL of this service, used to build provider callback URLs")
                .env("FEDERATO_BASE_URL"),
        )
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_KEY)
                .long(ARG_ACCESS_TOKEN_KEY)
                .help("Path to the RSA private key (PEM or DER) used to sign access tokens")
                .env("FEDERATO_ACCESS_TOKEN_KEY"),
        )
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_KID)
                .long(ARG_ACCESS_TOKEN_KID)
                .help("Key id advertised in the access token header")
                .default_value("k1")
                .env("FEDERATO_ACCESS_TOKEN_KID"),
        )
        .arg(
            Arg::new(ARG_GRANT_CODE_TTL_SECONDS)
                .long(ARG_GRANT_CODE_TTL_SECONDS)
                .help("Lifetime of one-time grant codes issued after a successful callback")
                .default_value(leaked_default(DEFAULT_GRANT_CODE_TTL_SECONDS))
                .env("FEDERATO_GRANT_CODE_TTL_SECONDS")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL_SECONDS)
                .long(ARG_ACCESS_TOKEN_TTL_SECONDS)
                .help("Lifetime of signed access tokens")
                .default_value(leaked_default(DEFAULT_ACCESS_TOKEN_TTL_SECONDS))
                .env("FEDERATO_ACCESS_TOKEN_TTL_SECONDS")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn leaked_default(seconds: i64) -> &'static str {
    Box::leak(seconds.to_string().into_boxed_str())
}

#[derive(Debug)]
pub struct Options {
    pub base_url: String,
    pub access_token_key_path: String,
    pub access_token_kid: String,
    pub grant_code_ttl_seconds: i64,
    pub access_token_ttl_seconds: i64,
}

impl Options {
    /// Extract OAuth options from validated CLI matches.
    ///
    /// # Errors
    /// Returns an error if a required argument is missing.
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        let base_url = matches
            .get_one::<String>(ARG_BASE_URL)
            .cloned()
            .context("missing required argument: --base-url")?;
        let access_token_key_path = matches
            .get_one::<String>(ARG_ACCESS_TOKEN_KEY)
            .cloned()
            .context("missing required argument: --access-token-key")?;
        let access_token_kid = matches
            .get_one::<String>(ARG_ACCESS_TOKEN_KID)
            .cloned()
            .unwrap_or_else(|| "k1".to_string());
        let grant_code_ttl_seconds = matches
            .get_one::<i64>(ARG_GRANT_CODE_TTL_SECONDS)
            .copied()
            .unwrap_or(DEFAULT_GRANT_CODE_TTL_SECONDS);
        let access_token_ttl_seconds = matches
            .get_one::<i64>(ARG_ACCESS_TOKEN_TTL_SECONDS)
            .copied()
            .unwrap_or(DEFAULT_ACCESS_TOKEN_TTL_SECONDS);

        Ok(Self {
            base_url,
            access_token_key_path,
            access_token_kid,
            grant_code_ttl_seconds,
            access_token_ttl_seconds,
        })
    }
}
