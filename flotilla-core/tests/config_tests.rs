//! Loading engine configuration from disk with environment overrides

use flotilla_core::config::EngineConfig;
use flotilla_core::{FanoutMode, FlotillaError};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::path::PathBuf;
use tempfile::TempDir;

const OVERRIDES: [&str; 4] = [
    "FLOTILLA_DATA_ROOT",
    "FLOTILLA_SSH_USER",
    "FLOTILLA_READINESS_ATTEMPTS",
    "FLOTILLA_FANOUT_MODE",
];

fn clear_overrides() {
    for var in OVERRIDES {
        std::env::remove_var(var);
    }
}

fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("flotilla.toml");
    std::fs::write(&path, contents).unwrap();
    path
}

const CONFIG: &str = r#"
[paths]
data_root = "/srv/flotilla"

[ssh]
user = "deploy"

[readiness]
attempts = 3
"#;

#[test]
#[serial]
fn test_from_file_without_overrides() {
    clear_overrides();
    let dir = TempDir::new().unwrap();

    let config = EngineConfig::from_file(write_config(&dir, CONFIG)).unwrap();
    assert_eq!(config.paths.data_root, PathBuf::from("/srv/flotilla"));
    assert_eq!(config.ssh.user, "deploy");
    assert_eq!(config.readiness.attempts, 3);
    assert_eq!(config.fanout.mode, FanoutMode::FirstError);
}

#[test]
#[serial]
fn test_env_overrides_win_over_file() {
    clear_overrides();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    std::env::set_var("FLOTILLA_DATA_ROOT", "/mnt/flotilla");
    std::env::set_var("FLOTILLA_SSH_USER", "admin");
    std::env::set_var("FLOTILLA_READINESS_ATTEMPTS", "9");
    std::env::set_var("FLOTILLA_FANOUT_MODE", "all-errors");
    let config = EngineConfig::from_file(&path);
    clear_overrides();

    let config = config.unwrap();
    assert_eq!(config.paths.data_root, PathBuf::from("/mnt/flotilla"));
    assert_eq!(config.ssh.user, "admin");
    assert_eq!(config.readiness.attempts, 9);
    assert_eq!(config.executor().mode(), FanoutMode::AllErrors);
}

#[test]
#[serial]
fn test_invalid_attempts_override() {
    clear_overrides();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    std::env::set_var("FLOTILLA_READINESS_ATTEMPTS", "many");
    let result = EngineConfig::from_file(&path);
    clear_overrides();

    match result.unwrap_err() {
        FlotillaError::Configuration { component, message } => {
            assert_eq!(component, "readiness");
            assert!(message.contains("FLOTILLA_READINESS_ATTEMPTS"));
        }
        other => panic!("expected configuration error, got {:?}", other),
    }
}

#[test]
#[serial]
fn test_zero_attempts_override_fails_validation() {
    clear_overrides();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    std::env::set_var("FLOTILLA_READINESS_ATTEMPTS", "0");
    let result = EngineConfig::from_file(&path);
    clear_overrides();

    assert!(result.unwrap_err().to_string().contains("attempts must be at least 1"));
}

#[test]
#[serial]
fn test_unknown_fanout_mode_override() {
    clear_overrides();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    std::env::set_var("FLOTILLA_FANOUT_MODE", "best-effort");
    let result = EngineConfig::from_file(&path);
    clear_overrides();

    match result.unwrap_err() {
        FlotillaError::InvalidInput { field, message } => {
            assert_eq!(field, "fanout.mode");
            assert!(message.contains("best-effort"));
        }
        other => panic!("expected invalid input, got {:?}", other),
    }
}

#[test]
#[serial]
fn test_missing_file() {
    clear_overrides();
    let dir = TempDir::new().unwrap();

    let err = EngineConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, FlotillaError::Configuration { .. }));
    assert!(err.to_string().contains("Failed to read config file"));
}
