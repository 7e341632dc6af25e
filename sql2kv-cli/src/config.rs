//! Server configuration.
//!
//! Three layers, later ones winning: the embedded `config/default.toml`, an
//! optional TOML file, then command-line flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use sql2kv_core::{PoolConfig, WriterConfig};

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Bridge between SQL writers and the bulk-load import service
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "sql2kv", author, version, about, long_about = None)]
pub struct Cli {
    /// TOML config file layered over the built-in defaults
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    pub addr: Option<String>,

    /// gRPC address of the import service
    #[arg(long)]
    pub importer_addr: Option<String>,

    /// MySQL protocol address of the SQL layer
    #[arg(long)]
    pub tidb_addr: Option<String>,

    /// SQL user
    #[arg(long)]
    pub tidb_user: Option<String>,

    /// SQL password
    #[arg(long, env = "SQL2KV_TIDB_PASSWORD", hide_env_values = true)]
    pub tidb_password: Option<String>,

    /// Status HTTP address of the SQL layer
    #[arg(long)]
    pub tidb_http_addr: Option<String>,

    /// Log level or filter directive
    #[arg(short, long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServerConfig {
    pub addr: String,
    pub importer_addr: String,
    pub tidb_addr: String,
    pub tidb_user: String,
    pub tidb_password: String,
    pub tidb_http_addr: String,
    pub log_level: String,
    pub pool: PoolSection,
    pub writer: WriterSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PoolSection {
    pub connections_per_address: usize,
    pub connect_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub keepalive_timeout_ms: u64,
    pub window_size: u32,
    pub max_message_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WriterSection {
    pub queue_capacity: usize,
    pub reconnect_backoff_ms: u64,
}

impl ServerConfig {
    /// Built-in defaults.
    ///
    /// # Errors
    ///
    /// Only if the embedded file is broken.
    pub fn defaults() -> Result<Self> {
        Self::from_table(default_table()?)
    }

    /// Defaults overlaid with the file at `path`.
    ///
    /// # Errors
    ///
    /// Unreadable files, invalid TOML, unknown keys or wrongly typed values.
    pub fn load_with_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Self::load_from_str(&contents)
            .with_context(|| format!("invalid config at {}", path.display()))
    }

    /// Defaults overlaid with `contents`.
    ///
    /// # Errors
    ///
    /// Invalid TOML, unknown keys or wrongly typed values.
    pub fn load_from_str(contents: &str) -> Result<Self> {
        let overlay: toml::Table = contents.parse()?;
        let mut table = default_table()?;
        merge_tables(&mut table, overlay);
        Self::from_table(table)
    }

    /// Resolve the full configuration for `cli`.
    ///
    /// # Errors
    ///
    /// See [`load_with_path`](Self::load_with_path).
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load_with_path(path)?,
            None => Self::defaults()?,
        };
        config.apply_flags(cli);
        Ok(config)
    }

    fn from_table(table: toml::Table) -> Result<Self> {
        toml::Value::Table(table)
            .try_into()
            .context("configuration does not match the expected layout")
    }

    /// Overwrite fields with the flags that were given.
    pub fn apply_flags(&mut self, cli: &Cli) {
        let overrides = [
            (&mut self.addr, &cli.addr),
            (&mut self.importer_addr, &cli.importer_addr),
            (&mut self.tidb_addr, &cli.tidb_addr),
            (&mut self.tidb_user, &cli.tidb_user),
            (&mut self.tidb_password, &cli.tidb_password),
            (&mut self.tidb_http_addr, &cli.tidb_http_addr),
            (&mut self.log_level, &cli.log_level),
        ];
        for (field, flag) in overrides {
            if let Some(value) = flag {
                field.clone_from(value);
            }
        }
    }

    /// Reject configurations the server cannot start with.
    ///
    /// # Errors
    ///
    /// Names the first offending key.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("addr", &self.addr),
            ("importer-addr", &self.importer_addr),
            ("tidb-http-addr", &self.tidb_http_addr),
            ("tidb-addr", &self.tidb_addr),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                bail!("{key} should not be empty");
            }
        }
        if self.pool.connections_per_address == 0 {
            bail!("pool.connections-per-address must be positive");
        }
        if self.writer.queue_capacity == 0 {
            bail!("writer.queue-capacity must be positive");
        }
        Ok(())
    }

    #[must_use]
    pub const fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            connections_per_address: self.pool.connections_per_address,
            connect_timeout: Duration::from_millis(self.pool.connect_timeout_ms),
            keepalive_interval: Duration::from_millis(self.pool.keepalive_interval_ms),
            keepalive_timeout: Duration::from_millis(self.pool.keepalive_timeout_ms),
            window_size: self.pool.window_size,
            max_message_size: self.pool.max_message_size,
        }
    }

    #[must_use]
    pub const fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            queue_capacity: self.writer.queue_capacity,
            reconnect_backoff: Duration::from_millis(self.writer.reconnect_backoff_ms),
        }
    }
}

fn default_table() -> Result<toml::Table> {
    DEFAULT_CONFIG
        .parse()
        .context("embedded default config is invalid")
}

/// Recursively overlay `overlay` onto `base`; nested tables merge key by key.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge_tables(existing, nested);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
