//! Integration tests for cow-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use std::path::PathBuf;

use cow_config::{Config, ConfigError, LogLevel};
use tempfile::tempdir;

fn no_env(_: &str) -> Option<String> {
    None
}

/// Test config loading from a real global config file
#[test]
fn test_load_global_config_from_file() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("global.toml");
    std::fs::write(
        &global,
        r#"
[store]
attribute_dir = "/var/lib/cow/attributes"
data_dir = "/var/lib/cow/blocks"
block_size = "64K"
fanout = true
sync = false

[reclaim]
immediate = false

[log]
level = "debug"
"#,
    )
    .unwrap();

    let config = Config::load_layers(&[global], no_env).unwrap();
    assert_eq!(config.store.attribute_dir, PathBuf::from("/var/lib/cow/attributes"));
    assert_eq!(config.store.data_dir, PathBuf::from("/var/lib/cow/blocks"));
    assert_eq!(config.store.block_size.get(), 65536);
    assert!(config.store.fanout);
    assert!(!config.store.sync);
    assert!(!config.reclaim.immediate);
    assert_eq!(config.log.level, LogLevel::Debug);
}

/// Test config hierarchy: project config overrides global key by key
#[test]
fn test_config_hierarchy_project_overrides_global() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("global.toml");
    let project = temp.path().join("project.toml");
    std::fs::write(
        &global,
        "[store]\ndata_dir = \"/global/blocks\"\nblock_size = 8192\nfanout = true\n",
    )
    .unwrap();
    std::fs::write(&project, "[store]\nblock_size = 4096\n").unwrap();

    let config = Config::load_layers(&[global, project], no_env).unwrap();
    assert_eq!(config.store.block_size.get(), 4096);
    // untouched keys survive from the global layer
    assert_eq!(config.store.data_dir, PathBuf::from("/global/blocks"));
    assert!(config.store.fanout);
}

/// Missing layers are skipped, leaving defaults
#[test]
fn test_missing_layers_use_defaults() {
    let temp = tempdir().unwrap();
    let config = Config::load_layers(&[temp.path().join("nope.toml")], no_env).unwrap();
    assert_eq!(config, Config::load_layers(&[], no_env).unwrap());
    assert_eq!(config.store.block_size.get(), 4096);
}

/// Environment wins over every file layer
#[test]
fn test_env_overrides_files() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("global.toml");
    std::fs::write(&global, "[store]\ndata_dir = \"/file/blocks\"\n").unwrap();

    let env = |name: &str| match name {
        "COW_DATA_DIR" => Some("%BASE%/blocks".to_string()),
        "BASE" => Some("/env".to_string()),
        _ => None,
    };
    let config = Config::load_layers(&[global], env).unwrap();
    assert_eq!(config.store.data_dir, PathBuf::from("/env/blocks"));
}

#[test]
fn test_explicit_file_must_exist() {
    let temp = tempdir().unwrap();
    let err = Config::load_from(temp.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn test_malformed_toml_is_reported() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("bad.toml");
    std::fs::write(&path, "[store\nblock_size = ").unwrap();

    let err = Config::load_layers(&[path], no_env).unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)));
}

#[test]
fn test_default_toml_parses_back() {
    let text = Config::default_toml();
    let parsed: Config = toml::from_str(&text).unwrap();
    assert_eq!(parsed, Config::default());
}
