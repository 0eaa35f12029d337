//! Configuration loading and root folder / API key resolution
//!
//! Tests that manipulate CRITIQ_* environment variables are marked #[serial].

use critiq_common::config::{
    load_toml_config, resolve_api_key, resolve_root_folder, write_toml_config, CritiqConfig,
    ROOT_FOLDER_ENV,
};
use critiq_common::Error;
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
root_folder = "/data/critiq"

[logging]
level = "debug"

[service]
base_url = "https://api.example.com/v1"
model = "gen-small"
api_key_env = "CRITIQ_TEST_KEY"
api_key = "toml-key"
max_retries = 2
concurrency = 8

[classification]
config_id = "prompt-v7"
temperature = 0.2

[sampler]
length_boundaries = [10, 30, 90]
split_ratio = 0.6

[gate]
alpha = 0.01

[normalization]
batch_size = 25
taxonomy_path = "taxonomy.toml"

[stage]
timeout_secs = 600
"#;

fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("critiq.toml");
    std::fs::write(&path, content).unwrap();
    path
}

fn parsed() -> CritiqConfig {
    toml::from_str(FULL_CONFIG).unwrap()
}

#[test]
fn test_load_full_config() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), FULL_CONFIG);

    let config = load_toml_config(&path).unwrap();
    assert_eq!(config.root_folder, Some(PathBuf::from("/data/critiq")));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.service.model, "gen-small");
    assert_eq!(config.service.max_retries, 2);
    assert_eq!(config.service.concurrency, 8);
    assert_eq!(config.classification.config_id, "prompt-v7");
    assert_eq!(config.sampler.length_boundaries, vec![10, 30, 90]);
    assert_eq!(config.gate.alpha, 0.01);
    assert_eq!(config.normalization.batch_size, 25);
    assert_eq!(config.stage.timeout_secs, 600);
}

#[test]
fn test_load_missing_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let result = load_toml_config(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_load_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();
    let content = FULL_CONFIG.replace("alpha = 0.01", "alpha = 1.5");
    let path = write_config(dir.path(), &content);
    assert!(matches!(load_toml_config(&path), Err(Error::Config(_))));
}

#[test]
fn test_load_rejects_missing_service_section() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), "root_folder = \"/tmp\"\n");
    assert!(matches!(load_toml_config(&path), Err(Error::Config(_))));
}

#[test]
fn test_write_then_load_preserves_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("out.toml");
    let config = parsed();

    write_toml_config(&config, &path).unwrap();
    assert!(!path.with_extension("toml.tmp").exists());

    let loaded = load_toml_config(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
#[serial]
fn test_root_folder_cli_has_priority() {
    env::set_var(ROOT_FOLDER_ENV, "/from/env");
    let cli = PathBuf::from("/from/cli");
    let root = resolve_root_folder(Some(&cli), ROOT_FOLDER_ENV, &parsed()).unwrap();
    assert_eq!(root, cli);
    env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_root_folder_env_over_toml() {
    env::set_var(ROOT_FOLDER_ENV, "/from/env");
    let root = resolve_root_folder(None, ROOT_FOLDER_ENV, &parsed()).unwrap();
    assert_eq!(root, PathBuf::from("/from/env"));
    env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_root_folder_falls_back_to_toml() {
    env::remove_var(ROOT_FOLDER_ENV);
    let root = resolve_root_folder(None, ROOT_FOLDER_ENV, &parsed()).unwrap();
    assert_eq!(root, PathBuf::from("/data/critiq"));
}

#[test]
#[serial]
fn test_root_folder_unresolved_is_error() {
    env::remove_var(ROOT_FOLDER_ENV);
    let mut config = parsed();
    config.root_folder = None;
    let result = resolve_root_folder(None, ROOT_FOLDER_ENV, &config);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
#[serial]
fn test_api_key_env_over_toml() {
    env::set_var("CRITIQ_TEST_KEY", "env-key");
    let config = parsed();
    assert_eq!(resolve_api_key(&config.service), Some("env-key".to_string()));
    env::remove_var("CRITIQ_TEST_KEY");
}

#[test]
#[serial]
fn test_api_key_falls_back_to_toml() {
    env::remove_var("CRITIQ_TEST_KEY");
    let config = parsed();
    assert_eq!(resolve_api_key(&config.service), Some("toml-key".to_string()));
}

#[test]
#[serial]
fn test_api_key_blank_values_ignored() {
    env::set_var("CRITIQ_TEST_KEY", "   ");
    let mut config = parsed();
    config.service.api_key = Some(String::new());
    assert_eq!(resolve_api_key(&config.service), None);
    env::remove_var("CRITIQ_TEST_KEY");
}
