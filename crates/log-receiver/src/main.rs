//! Process entry point (C0): parses configuration, builds the configured
//! auth context, installs logging, and runs the reactor until shutdown.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use log_receiver::auth::{AuthContext, DisabledAuth, SharedSecretAuth};
use log_receiver::config::{AuthConfig, Cli};
use log_receiver::error::StartError;
use log_receiver::reactor;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, errno = err.errno(), "log receiver exited");
            ExitCode::from(u8::try_from(err.errno()).unwrap_or(1))
        }
    }
}

fn run(cli: Cli) -> Result<(), StartError> {
    let auth_config = cli.auth.clone();
    let config = cli.into_config()?;
    let auth_ctx = build_auth_context(&auth_config)?;
    reactor::run(config, auth_ctx)
}

/// Builds the configured auth context: `DisabledAuth` if no secret file was
/// given, otherwise a `SharedSecretAuth` loaded from it. `--required` with no
/// secret file is rejected up front rather than silently accepting every
/// peer.
fn build_auth_context(auth: &AuthConfig) -> Result<Box<dyn AuthContext>, StartError> {
    match &auth.secret_file {
        None => {
            if auth.required {
                return Err(StartError::InvalidAuthConfig(
                    "auth.required is set but no auth.secret-file was given".to_string(),
                ));
            }
            Ok(Box::new(DisabledAuth))
        }
        Some(path) => {
            let secrets = load_secret_file(path)?;
            Ok(Box::new(SharedSecretAuth::new(secrets, std::time::Duration::from_secs(60 * 60))))
        }
    }
}

/// Parses a `name=secret` line-delimited file: one principal per line, blank
/// lines and `#`-prefixed comments ignored.
fn load_secret_file(path: &Path) -> Result<HashMap<String, Vec<u8>>, StartError> {
    let text = fs::read_to_string(path).map_err(StartError::Io)?;
    let mut secrets = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, secret) = line
            .split_once('=')
            .ok_or_else(|| StartError::InvalidAuthConfig(format!("malformed secret file line: {line}")))?;
        secrets.insert(name.trim().to_string(), secret.trim().as_bytes().to_vec());
    }
    Ok(secrets)
}
