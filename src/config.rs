use std::path::PathBuf;

use crate::error::{Error, Result};

/// Authentication mode for the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    Disabled,
    Token,
}

/// Runtime configuration, resolved once at startup.
///
/// Resolution is environment-driven:
/// - `KENAZ_VAULT_DIR` — vault root (required, must exist)
/// - `KENAZ_DB_PATH`   — SQLite index file (required, parent created)
/// - `KENAZ_PORT`      — HTTP bind port (default 7777)
/// - `KENAZ_LOG`       — tracing env-filter (default "kenaz=info")
/// - `KENAZ_AUTH_MODE` — "disabled" (default) or "token"
/// - `KENAZ_AUTH_TOKEN`— bearer token, required non-empty in token mode
#[derive(Debug, Clone)]
pub struct Config {
    pub vault_dir: PathBuf,
    pub db_path: PathBuf,
    pub port: u16,
    pub log_filter: String,
    pub auth_mode: AuthMode,
    pub auth_token: String,
    /// Minimum seconds between `graph.updated` broadcasts.
    pub graph_throttle_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let vault_dir = std::env::var("KENAZ_VAULT_DIR")
            .map(PathBuf::from)
            .map_err(|_| Error::Invalid("KENAZ_VAULT_DIR is not set".into()))?;
        if !vault_dir.is_dir() {
            return Err(Error::Invalid(format!(
                "vault directory does not exist: {}",
                vault_dir.display()
            )));
        }

        let db_path = std::env::var("KENAZ_DB_PATH")
            .map(PathBuf::from)
            .map_err(|_| Error::Invalid("KENAZ_DB_PATH is not set".into()))?;

        let port = match std::env::var("KENAZ_PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| Error::Invalid(format!("invalid KENAZ_PORT: {raw}")))?,
            Err(_) => 7777,
        };

        let log_filter =
            std::env::var("KENAZ_LOG").unwrap_or_else(|_| "kenaz=info,tower_http=warn".into());

        let auth_mode = match std::env::var("KENAZ_AUTH_MODE").as_deref() {
            Ok("token") => AuthMode::Token,
            Ok("disabled") | Err(_) => AuthMode::Disabled,
            Ok(other) => {
                return Err(Error::Invalid(format!("invalid KENAZ_AUTH_MODE: {other}")))
            }
        };

        let auth_token = std::env::var("KENAZ_AUTH_TOKEN").unwrap_or_default();
        if auth_mode == AuthMode::Token && auth_token.is_empty() {
            return Err(Error::Invalid(
                "KENAZ_AUTH_TOKEN must be non-empty when KENAZ_AUTH_MODE=token".into(),
            ));
        }

        Ok(Config {
            vault_dir,
            db_path,
            port,
            log_filter,
            auth_mode,
            auth_token,
            graph_throttle_secs: 2,
        })
    }
}
