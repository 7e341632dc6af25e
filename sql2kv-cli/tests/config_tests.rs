#![allow(missing_docs, clippy::expect_used, clippy::unwrap_used)]

use std::path::PathBuf;

use clap::Parser;
use sql2kv_cli::{Cli, ServerConfig};

fn complete() -> ServerConfig {
    let mut config = ServerConfig::defaults().expect("defaults");
    config.importer_addr = "127.0.0.1:8287".to_string();
    config.tidb_addr = "127.0.0.1:4000".to_string();
    config.tidb_http_addr = "127.0.0.1:10080".to_string();
    config
}

#[test]
fn defaults_need_addresses_before_validating() {
    let config = ServerConfig::defaults().expect("defaults");
    let err = config.validate().unwrap_err();
    assert_eq!(err.to_string(), "importer-addr should not be empty");

    complete().validate().expect("complete config is valid");
}

#[test]
fn file_layers_over_defaults() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("sql2kv.toml");
    std::fs::write(
        &path,
        r#"
importer-addr = "importer:8287"
tidb-addr = "tidb:4000"
tidb-http-addr = "tidb:10080"

[writer]
queue-capacity = 64
"#,
    )
    .expect("write config");

    let config = ServerConfig::load_with_path(&path).expect("load config");
    assert_eq!(config.importer_addr, "importer:8287");
    assert_eq!(config.writer.queue_capacity, 64);
    assert_eq!(config.writer.reconnect_backoff_ms, 1000);
    assert_eq!(config.tidb_user, "root");
    assert_eq!(config.addr, "localhost:20280");
    config.validate().expect("valid");
}

#[test]
fn flags_override_the_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("sql2kv.toml");
    std::fs::write(&path, "importer-addr = \"file:1\"\nlog-level = \"debug\"\n")
        .expect("write config");

    let cli = Cli::parse_from([
        "sql2kv",
        "--config",
        path.to_str().expect("utf-8 path"),
        "--importer-addr",
        "flag:2",
        "--tidb-user",
        "loader",
    ]);
    let config = ServerConfig::from_cli(&cli).expect("resolve config");
    assert_eq!(config.importer_addr, "flag:2");
    assert_eq!(config.tidb_user, "loader");
    assert_eq!(config.log_level, "debug");
}

#[test]
fn unknown_keys_are_rejected() {
    let err = ServerConfig::load_from_str("importer = \"typo:1\"\n").unwrap_err();
    assert!(format!("{err:#}").contains("importer"));

    let err = ServerConfig::load_from_str("[pool]\nsize = 3\n").unwrap_err();
    assert!(format!("{err:#}").contains("size"));
}

#[test]
fn zero_sizes_are_invalid() {
    let mut config = complete();
    config.pool.connections_per_address = 0;
    assert!(config.validate().is_err());

    let mut config = complete();
    config.writer.queue_capacity = 0;
    assert!(config.validate().is_err());

    let mut config = complete();
    config.addr = "  ".to_string();
    assert_eq!(
        config.validate().unwrap_err().to_string(),
        "addr should not be empty"
    );
}

#[test]
fn missing_file_is_an_error() {
    let cli = Cli {
        config: Some(PathBuf::from("/nonexistent/sql2kv.toml")),
        ..Cli::default()
    };
    let err = ServerConfig::from_cli(&cli).unwrap_err();
    assert!(err.to_string().contains("failed to read config"));
}

#[test]
fn derived_pool_and_writer_settings() {
    let config = ServerConfig::load_from_str(
        "[pool]\nconnect-timeout-ms = 250\n[writer]\nreconnect-backoff-ms = 20\n",
    )
    .expect("load");
    assert_eq!(
        config.pool_config().connect_timeout,
        std::time::Duration::from_millis(250)
    );
    assert_eq!(
        config.writer_config().reconnect_backoff,
        std::time::Duration::from_millis(20)
    );
}
