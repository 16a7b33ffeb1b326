//! Unit tests for configuration loading and graceful degradation
//!
//! Tests that manipulate EXPFLOW_CONFIG are marked with #[serial] so they
//! never race each other on the process environment.

use expflow_common::config::{
    resolve_config_path, ApiConfig, SourceConfig, TomlConfig, CONFIG_ENV_VAR,
};
use serial_test::serial;
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("expflow.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

#[test]
fn test_defaults_point_at_local_experiment_server() {
    let config = TomlConfig::default();

    match config.source {
        SourceConfig::Remote {
            server_url,
            retry_delay_ms,
            request_timeout_ms,
            start_from_block,
        } => {
            assert_eq!(server_url, "http://127.0.0.1:5000");
            assert_eq!(retry_delay_ms, 5000);
            assert_eq!(request_timeout_ms, 5000);
            assert!(start_from_block.is_none());
        }
        other => panic!("expected remote default, got {:?}", other),
    }
    assert_eq!(config.session.study_name, "study");
    assert_eq!(config.session.session_number, 1);
    assert_eq!(config.api, ApiConfig::default());
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_parse_local_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
[session]
study_name = "pointing"
session_number = 3

[session.participant_details]
handedness = "left"

[source]
kind = "local"
participant_index = 7
config_file = "blocks.json"
"#,
    );

    let config = TomlConfig::load(Some(&path)).unwrap();
    assert_eq!(config.session.study_name, "pointing");
    assert_eq!(config.session.session_number, 3);
    assert_eq!(config.session.participant_details["handedness"], "left");
    assert_eq!(
        config.source,
        SourceConfig::Local {
            participant_index: 7,
            config_file: PathBuf::from("blocks.json"),
        }
    );
    // Sections left out fall back to defaults
    assert_eq!(config.runner.default_trials_per_block, 1);
}

#[test]
fn test_parse_remote_source_with_partial_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
[source]
kind = "remote"
server_url = "http://10.0.0.2:5000"
start_from_block = 0
"#,
    );

    let config = TomlConfig::load(Some(&path)).unwrap();
    assert_eq!(
        config.source,
        SourceConfig::Remote {
            server_url: "http://10.0.0.2:5000".to_string(),
            retry_delay_ms: 5000,
            request_timeout_ms: 5000,
            start_from_block: Some(0),
        }
    );
}

#[test]
fn test_malformed_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[source]\nkind = \"carrier-pigeon\"\n");

    assert!(matches!(
        TomlConfig::load(Some(&path)),
        Err(expflow_common::Error::Config(_))
    ));
}

#[test]
fn test_missing_cli_file_degrades_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");

    let config = TomlConfig::load(Some(&missing)).unwrap();
    assert_eq!(config, TomlConfig::default());
}

#[test]
#[serial]
fn test_cli_argument_beats_environment() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/from-env.toml");

    let resolved = resolve_config_path(Some(Path::new("/tmp/from-cli.toml")), CONFIG_ENV_VAR);
    assert_eq!(resolved, Some(PathBuf::from("/tmp/from-cli.toml")));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_environment_used_without_cli_argument() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/from-env.toml");

    let resolved = resolve_config_path(None, CONFIG_ENV_VAR);
    assert_eq!(resolved, Some(PathBuf::from("/tmp/from-env.toml")));

    env::remove_var(CONFIG_ENV_VAR);
}
