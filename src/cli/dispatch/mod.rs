use crate::cli::actions::{server, Action};
use anyhow::{Context, Result};

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let required = |name: &str| -> Result<String> {
        matches
            .get_one::<String>(name)
            .map(String::to_string)
            .with_context(|| format!("missing required argument: --{name}"))
    };

    Ok(Action::Server(server::Args {
        port: matches.get_one::<u16>("port").copied().unwrap_or(8080),
        dsn: matches.get_one::<String>("dsn").map(String::to_string),
        pepper: required("pepper")?,
        salt_secret: required("salt-secret")?,
        jwt_private_key_path: required("jwt-private-key")?,
        jwt_public_key_path: required("jwt-public-key")?,
        access_ttl_seconds: matches.get_one::<i64>("access-ttl").copied().unwrap_or(900),
        refresh_ttl_seconds: matches
            .get_one::<i64>("refresh-ttl")
            .copied()
            .unwrap_or(2_592_000),
        rate_limit_attempts: matches
            .get_one::<u32>("rate-limit-attempts")
            .copied()
            .unwrap_or(5),
        rate_limit_window_seconds: matches
            .get_one::<u64>("rate-limit-window")
            .copied()
            .unwrap_or(900),
    }))
}
