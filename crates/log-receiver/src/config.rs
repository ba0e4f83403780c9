//! Process configuration: a `clap`-derived CLI with environment-variable
//! fallbacks, validated once at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, ValueEnum};

use crate::error::StartError;

const MIN_READ_AHEAD: usize = 512;
const MAX_READ_AHEAD: usize = 64 << 20;

/// Digest algorithm the shared-secret auth context verifies responses with.
#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum AuthDigest {
    #[default]
    HmacSha256,
}

/// Auth-related parameters, flattened into the top-level CLI.
#[derive(Args, Debug, Clone)]
pub struct AuthConfig {
    /// Reject connections that never authenticate.
    #[arg(long, env = "LOG_RECEIVER_AUTH_REQUIRED")]
    pub required: bool,

    /// Path to a `name=secret` line-delimited file. Absent means auth is
    /// disabled regardless of `--required`.
    #[arg(long, env = "LOG_RECEIVER_AUTH_SECRET_FILE")]
    pub secret_file: Option<PathBuf>,

    #[arg(long, env = "LOG_RECEIVER_AUTH_DIGEST", default_value = "hmac-sha256")]
    pub digest: AuthDigest,
}

/// Top-level CLI / environment configuration, parsed once at process start.
#[derive(Parser, Debug, Clone)]
#[command(name = "log-receiver", about = "Replicated transaction log receiver")]
pub struct Cli {
    #[arg(long, env = "LOG_RECEIVER_LISTEN_ON")]
    pub listen_on: SocketAddr,

    /// File the accepted transaction log is appended to.
    #[arg(long, env = "LOG_RECEIVER_LOG_FILE")]
    pub log_file: PathBuf,

    #[arg(long, env = "LOG_RECEIVER_REAUTH_TIMEOUT", value_parser = humantime::parse_duration, default_value = "5m")]
    pub re_auth_timeout: Duration,

    #[arg(long, env = "LOG_RECEIVER_IPV6_ONLY")]
    pub ipv6_only: bool,

    #[arg(long, env = "LOG_RECEIVER_MAX_READ_AHEAD", default_value_t = 1 << 20)]
    pub max_read_ahead: usize,

    #[arg(long, env = "LOG_RECEIVER_MAX_CONNECTION_COUNT", default_value_t = 256)]
    pub max_connection_count: usize,

    #[arg(long, env = "LOG_RECEIVER_TIMEOUT", value_parser = humantime::parse_duration, default_value = "1m")]
    pub timeout: Duration,

    /// Server id, required; used to disambiguate which receiver sent a
    /// particular ack on its first emission per connection.
    #[arg(long, env = "LOG_RECEIVER_ID")]
    pub id: Option<u64>,

    #[command(flatten)]
    pub auth: AuthConfig,
}

/// Validated configuration, the receiver's only view of process
/// parameters once startup completes.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_on: SocketAddr,
    pub log_file: PathBuf,
    pub re_auth_timeout: Duration,
    pub ipv6_only: bool,
    pub max_read_ahead: usize,
    pub max_connection_count: usize,
    pub timeout: Duration,
    pub id: u64,
    pub auth: AuthConfig,
}

impl Cli {
    /// Validates a parsed `Cli` into a `Config`, clamping `max_read_ahead`
    /// and rejecting an unset `id` with `EINVAL` (`listen_on` is already
    /// validated by `clap`'s `SocketAddr` parser, so it can't reach here
    /// malformed).
    pub fn into_config(self) -> Result<Config, StartError> {
        let id = self.id.ok_or(StartError::MissingServerId)?;
        Ok(Config {
            listen_on: self.listen_on,
            log_file: self.log_file,
            re_auth_timeout: self.re_auth_timeout,
            ipv6_only: self.ipv6_only,
            max_read_ahead: self.max_read_ahead.clamp(MIN_READ_AHEAD, MAX_READ_AHEAD),
            max_connection_count: self.max_connection_count,
            timeout: self.timeout,
            id,
            auth: self.auth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_id_is_rejected() {
        let cli = Cli {
            listen_on: "127.0.0.1:10000".parse().unwrap(),
            log_file: PathBuf::from("/tmp/log-receiver-test.log"),
            re_auth_timeout: Duration::from_secs(300),
            ipv6_only: false,
            max_read_ahead: 1 << 20,
            max_connection_count: 256,
            timeout: Duration::from_secs(60),
            id: None,
            auth: AuthConfig { required: false, secret_file: None, digest: AuthDigest::HmacSha256 },
        };
        assert!(matches!(cli.into_config(), Err(StartError::MissingServerId)));
    }

    #[test]
    fn read_ahead_is_clamped() {
        let cli = Cli {
            listen_on: "127.0.0.1:10000".parse().unwrap(),
            log_file: PathBuf::from("/tmp/log-receiver-test.log"),
            re_auth_timeout: Duration::from_secs(300),
            ipv6_only: false,
            max_read_ahead: 16,
            max_connection_count: 256,
            timeout: Duration::from_secs(60),
            id: Some(1),
            auth: AuthConfig { required: false, secret_file: None, digest: AuthDigest::HmacSha256 },
        };
        let config = cli.into_config().unwrap();
        assert_eq!(config.max_read_ahead, MIN_READ_AHEAD);
    }
}
