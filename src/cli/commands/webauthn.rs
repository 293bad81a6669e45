use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};

pub const ARG_RP_ID: &str = "rp-id";
pub const ARG_RP_ORIGIN: &str = "rp-origin";

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_RP_ID)
                .long(ARG_RP_ID)
                .help("WebAuthn relying party id, e.g. atesti.dev")
                .env("ATESTI_RP_ID")
                .required(true),
        )
        .arg(
            Arg::new(ARG_RP_ORIGIN)
                .long(ARG_RP_ORIGIN)
                .help("Allowed browser origin; repeat the flag or comma-separate the env value. Refresh cookies are marked Secure only when every origin is https.")
                .env("ATESTI_RP_ORIGIN")
                .required(true)
                .action(ArgAction::Append)
                .value_delimiter(','),
        )
        .arg(
            Arg::new("rp-name")
                .long("rp-name")
                .help("Human-readable relying party name shown by authenticators")
                .env("ATESTI_RP_NAME")
                .default_value("atesti"),
        )
        .arg(
            Arg::new("passkey-challenge-ttl-seconds")
                .long("passkey-challenge-ttl-seconds")
                .help("Passkey ceremony challenge TTL in seconds")
                .env("ATESTI_PASSKEY_CHALLENGE_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub rp_id: String,
    pub rp_name: String,
    pub origins: Vec<String>,
    pub challenge_ttl_seconds: i64,
}

impl Options {
    /// Collect `WebAuthn` arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the relying party id or origins are missing.
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        let rp_id = matches
            .get_one::<String>(ARG_RP_ID)
            .cloned()
            .context("missing required argument: --rp-id")?;
        let origins: Vec<String> = matches
            .get_many::<String>(ARG_RP_ORIGIN)
            .context("missing required argument: --rp-origin")?
            .cloned()
            .collect();

        Ok(Self {
            rp_id,
            rp_name: matches
                .get_one::<String>("rp-name")
                .cloned()
                .unwrap_or_else(|| "atesti".to_string()),
            origins,
            challenge_ttl_seconds: matches
                .get_one::<i64>("passkey-challenge-ttl-seconds")
                .copied()
                .unwrap_or(300),
        })
    }
}
