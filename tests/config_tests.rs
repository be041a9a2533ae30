//! Configuration resolution from the environment.
//!
//! Env vars are process-global, so every test holds one lock while it
//! mutates them.

use std::sync::Mutex;

use tempfile::TempDir;

use kenaz::config::{AuthMode, Config};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn set_base_env(dir: &TempDir) {
    std::env::set_var("KENAZ_VAULT_DIR", dir.path());
    std::env::set_var("KENAZ_DB_PATH", dir.path().join("kenaz.db"));
    for var in ["KENAZ_PORT", "KENAZ_LOG", "KENAZ_AUTH_MODE", "KENAZ_AUTH_TOKEN"] {
        std::env::remove_var(var);
    }
}

#[test]
fn defaults_apply() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = TempDir::new().unwrap();
    set_base_env(&dir);

    let config = Config::from_env().unwrap();
    assert_eq!(config.port, 7777);
    assert_eq!(config.auth_mode, AuthMode::Disabled);
    assert_eq!(config.graph_throttle_secs, 2);
}

#[test]
fn missing_vault_dir_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = TempDir::new().unwrap();
    set_base_env(&dir);
    std::env::set_var("KENAZ_VAULT_DIR", dir.path().join("does-not-exist"));

    assert!(Config::from_env().is_err());
}

#[test]
fn invalid_port_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = TempDir::new().unwrap();
    set_base_env(&dir);

    for bad in ["0", "65536", "http"] {
        std::env::set_var("KENAZ_PORT", bad);
        assert!(Config::from_env().is_err(), "port {bad} should be rejected");
    }
}

#[test]
fn token_mode_requires_a_token() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = TempDir::new().unwrap();
    set_base_env(&dir);
    std::env::set_var("KENAZ_AUTH_MODE", "token");

    assert!(Config::from_env().is_err());

    std::env::set_var("KENAZ_AUTH_TOKEN", "s3cret");
    let config = Config::from_env().unwrap();
    assert_eq!(config.auth_mode, AuthMode::Token);
    assert_eq!(config.auth_token, "s3cret");
}
