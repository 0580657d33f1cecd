//! Config loading and saving

use std::fs;

use priosched::util::config::{load_config, load_config_or_default, save_config, ConfigError};
use priosched::{SchedulerConfig, TaskPriority};

#[test]
fn test_save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("priosched.toml");
    let config = SchedulerConfig {
        pool_size: 3,
        default_priority: TaskPriority::Low,
        stack_size: Some(256 * 1024),
        ..SchedulerConfig::default()
    };

    save_config(&config, &path).unwrap();
    assert_eq!(load_config(&path).unwrap(), config);
}

#[test]
fn test_missing_fields_use_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.toml");
    fs::write(&path, "default_priority = \"starvable\"\nkeep_alive_ms = 250\n").unwrap();

    let config = load_config_or_default(Some(path.as_path())).unwrap();
    assert_eq!(config.default_priority, TaskPriority::Starvable);
    assert_eq!(config.keep_alive_ms, 250);
    assert_eq!(config.max_wait_for_low_priority_ms, 500);
    assert_eq!(config.thread_name_prefix, "priosched-worker");
    assert!(config.daemon_threads);
    assert!(config.pool_size >= 1);
}

#[test]
fn test_zero_pool_size_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "pool_size = 0\n").unwrap();

    assert!(matches!(load_config(&path), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_unknown_priority_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "default_priority = \"urgent\"\n").unwrap();

    assert!(matches!(load_config(&path), Err(ConfigError::ParseError(_))));
}

#[test]
fn test_missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    assert!(matches!(load_config(&path), Err(ConfigError::IoError(_))));
}
