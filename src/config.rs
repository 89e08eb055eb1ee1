//! Command line flags and feed credentials.

use clap::Parser;

/// Bluesky-to-IRC bridge: serves your home timeline as `#timeline`.
#[derive(Debug, Parser)]
#[command(name = "skybridge", version, about)]
pub struct Args {
    /// Port to listen on for IRC connections.
    #[arg(short, long, default_value_t = 6667)]
    pub port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Enable debug logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Feed login material, taken from the environment so it never appears
/// in `ps` output or shell history.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub handle: String,
    pub app_password: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set in the environment")]
    MissingVar(&'static str),
}

impl Credentials {
    /// Read `BSKY_HANDLE` and `BSKY_APP_PASSWORD` from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            handle: require("BSKY_HANDLE")?,
            app_password: require("BSKY_APP_PASSWORD")?,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::MissingVar(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_parse() {
        Args::command().debug_assert();
        let args = Args::parse_from(["skybridge", "-p", "6697", "-v"]);
        assert_eq!(args.port, 6697);
        assert!(args.verbose);
        assert_eq!(args.bind, "0.0.0.0");
    }

    #[test]
    fn defaults() {
        let args = Args::parse_from(["skybridge"]);
        assert_eq!(args.port, 6667);
        assert!(!args.verbose);
    }
}
