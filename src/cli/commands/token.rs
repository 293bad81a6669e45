use anyhow::{Context, Result};
use clap::{Arg, Command};
use secrecy::SecretString;

pub const ARG_TOKEN_SIGNING_SEED: &str = "token-signing-seed";

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TOKEN_SIGNING_SEED)
                .long(ARG_TOKEN_SIGNING_SEED)
                .help("Base64-encoded 32-byte Ed25519 seed for access token signing")
                .env("ATESTI_TOKEN_SIGNING_SEED")
                .required(true)
                .hide_env_values(true),
        )
        .arg(
            Arg::new("token-issuer")
                .long("token-issuer")
                .help("Issuer claim stamped into access tokens")
                .env("ATESTI_TOKEN_ISSUER")
                .default_value("https://atesti.dev"),
        )
        .arg(
            Arg::new("token-audience")
                .long("token-audience")
                .help("Audience claim stamped into access tokens")
                .env("ATESTI_TOKEN_AUDIENCE")
                .default_value("atesti"),
        )
        .arg(
            Arg::new("access-token-ttl-seconds")
                .long("access-token-ttl-seconds")
                .help("Access token TTL in seconds")
                .env("ATESTI_ACCESS_TOKEN_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("refresh-token-ttl-seconds")
                .long("refresh-token-ttl-seconds")
                .help("Refresh token TTL in seconds")
                .env("ATESTI_REFRESH_TOKEN_TTL_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("refresh-reuse-grace-seconds")
                .long("refresh-reuse-grace-seconds")
                .help("Window in which replaying a just-rotated refresh token is treated as a network retry")
                .env("ATESTI_REFRESH_REUSE_GRACE_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(i64)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub signing_seed: SecretString,
    pub issuer: String,
    pub audience: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub reuse_grace_seconds: i64,
}

impl Options {
    /// Collect token arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the signing seed is missing.
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        let signing_seed = matches
            .get_one::<String>(ARG_TOKEN_SIGNING_SEED)
            .cloned()
            .map(SecretString::from)
            .context("missing required argument: --token-signing-seed")?;

        Ok(Self {
            signing_seed,
            issuer: matches
                .get_one::<String>("token-issuer")
                .cloned()
                .unwrap_or_else(|| "https://atesti.dev".to_string()),
            audience: matches
                .get_one::<String>("token-audience")
                .cloned()
                .unwrap_or_else(|| "atesti".to_string()),
            access_ttl_seconds: matches
                .get_one::<i64>("access-token-ttl-seconds")
                .copied()
                .unwrap_or(900),
            refresh_ttl_seconds: matches
                .get_one::<i64>("refresh-token-ttl-seconds")
                .copied()
                .unwrap_or(2_592_000),
            reuse_grace_seconds: matches
                .get_one::<i64>("refresh-reuse-grace-seconds")
                .copied()
                .unwrap_or(5),
        })
    }
}
