//! Canal configuration
//!
//! Loaded from JSON by the CLI or built in code with the `with_*` methods.
//! Durations are plain millisecond counts.

use crate::common::{CanalError, Result, TableFilterConfig};
use crate::mysql::{Flavor, SyncerConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Snapshot dump settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    /// mysqldump binary name or path; empty disables the dump
    pub executable_path: String,
    /// Databases to dump; empty with no `table_db` dumps everything
    pub databases: Vec<String>,
    /// Database holding `tables`
    pub table_db: String,
    pub tables: Vec<String>,
    /// `db,table` pairs passed as `--ignore-table`
    pub ignore_tables: Vec<String>,
    /// `--where` filter applied to every table
    pub where_clause: String,
    /// Send mysqldump stderr to /dev/null
    pub discard_err: bool,
    /// Omit `--master-data`; the position is read before dumping instead
    pub skip_master_data: bool,
    pub max_allowed_packet_mb: u32,
    /// `--protocol` value, e.g. `tcp`
    pub protocol: String,
    /// Dump binary columns as hex literals
    pub hex_blob: bool,
    pub extra_options: Vec<String>,
    /// Capacity of the parsed-line channel
    pub channel_capacity: usize,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            executable_path: "mysqldump".to_string(),
            databases: Vec::new(),
            table_db: String::new(),
            tables: Vec::new(),
            ignore_tables: Vec::new(),
            where_clause: String::new(),
            discard_err: true,
            skip_master_data: false,
            max_allowed_packet_mb: 0,
            protocol: String::new(),
            hex_blob: true,
            extra_options: Vec::new(),
            channel_capacity: 1024,
        }
    }
}

impl DumpConfig {
    pub fn is_enabled(&self) -> bool {
        !self.executable_path.is_empty()
    }

    /// Parsed `--ignore-table` entries; malformed ones are dropped.
    pub fn ignore_table_pairs(&self) -> Vec<(String, String)> {
        self.ignore_tables
            .iter()
            .filter_map(|entry| {
                let (db, table) = entry.split_once(',')?;
                let (db, table) = (db.trim(), table.trim());
                (!db.is_empty() && !table.is_empty()).then(|| (db.to_string(), table.to_string()))
            })
            .collect()
    }
}

/// Canal configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanalConfig {
    /// `host:port`, or a unix socket path
    pub addr: String,
    pub user: String,
    pub password: String,
    pub charset: String,
    /// Replica server id; must be unique in the topology
    pub server_id: u32,
    pub flavor: Flavor,
    pub heartbeat_period_ms: u64,
    pub read_timeout_ms: u64,
    pub include_table_regex: Vec<String>,
    pub exclude_table_regex: Vec<String>,
    /// Skip rows events whose table metadata cannot be fetched
    pub discard_no_meta_row_event: bool,
    /// Reconnect attempts before giving up; 0 or less retries forever
    pub max_reconnect_attempts: i32,
    pub disable_retry_sync: bool,
    pub semi_sync_enabled: bool,
    /// Do not run `FLUSH BINARY LOGS` while waiting for a position
    pub disable_flush_binlog_while_waiting: bool,
    /// Where replication coordinates are persisted
    pub master_info_path: Option<PathBuf>,
    pub master_info_flush_interval_ms: u64,
    pub event_channel_capacity: usize,
    pub dump: DumpConfig,
}

impl Default for CanalConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3306".to_string(),
            user: "root".to_string(),
            password: String::new(),
            charset: "utf8mb4".to_string(),
            server_id: 1001,
            flavor: Flavor::MySql,
            heartbeat_period_ms: 30_000,
            read_timeout_ms: 90_000,
            include_table_regex: Vec::new(),
            exclude_table_regex: Vec::new(),
            discard_no_meta_row_event: false,
            max_reconnect_attempts: 10,
            disable_retry_sync: false,
            semi_sync_enabled: false,
            disable_flush_binlog_while_waiting: false,
            master_info_path: None,
            master_info_flush_interval_ms: 1_000,
            event_channel_capacity: 10_240,
            dump: DumpConfig::default(),
        }
    }
}

impl std::fmt::Debug for CanalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanalConfig")
            .field("addr", &self.addr)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("charset", &self.charset)
            .field("server_id", &self.server_id)
            .field("flavor", &self.flavor)
            .field("heartbeat_period_ms", &self.heartbeat_period_ms)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("include_table_regex", &self.include_table_regex)
            .field("exclude_table_regex", &self.exclude_table_regex)
            .field("discard_no_meta_row_event", &self.discard_no_meta_row_event)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("disable_retry_sync", &self.disable_retry_sync)
            .field("semi_sync_enabled", &self.semi_sync_enabled)
            .field(
                "disable_flush_binlog_while_waiting",
                &self.disable_flush_binlog_while_waiting,
            )
            .field("master_info_path", &self.master_info_path)
            .field(
                "master_info_flush_interval_ms",
                &self.master_info_flush_interval_ms,
            )
            .field("dump", &self.dump)
            .finish()
    }
}

impl CanalConfig {
    pub fn new(addr: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn with_flavor(mut self, flavor: Flavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn include_table(mut self, pattern: impl Into<String>) -> Self {
        self.include_table_regex.push(pattern.into());
        self
    }

    pub fn exclude_table(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_table_regex.push(pattern.into());
        self
    }

    pub fn with_master_info_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.master_info_path = Some(path.into());
        self
    }

    pub fn with_dump(mut self, dump: DumpConfig) -> Self {
        self.dump = dump;
        self
    }

    /// Disable the snapshot dump.
    pub fn without_dump(mut self) -> Self {
        self.dump.executable_path.clear();
        self
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn master_info_flush_interval(&self) -> Duration {
        Duration::from_millis(self.master_info_flush_interval_ms)
    }

    pub fn table_filter(&self) -> TableFilterConfig {
        TableFilterConfig {
            include_table_regex: self.include_table_regex.clone(),
            exclude_table_regex: self.exclude_table_regex.clone(),
        }
    }

    /// Split `addr` into host and port; sockets yield port 0.
    pub fn host_port(&self) -> Result<(String, u16)> {
        if self.is_socket() {
            return Ok((self.addr.clone(), 0));
        }
        match self.addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| CanalError::config(format!("invalid port in addr '{}'", self.addr)))?;
                Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
            }
            None => Ok((self.addr.clone(), 3306)),
        }
    }

    pub fn is_socket(&self) -> bool {
        self.addr.contains('/')
    }

    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Err(CanalError::config("addr must not be empty"));
        }
        if self.user.is_empty() {
            return Err(CanalError::config("user must not be empty"));
        }
        if self.server_id == 0 {
            return Err(CanalError::config("server_id must be non-zero"));
        }
        if self.event_channel_capacity == 0 || self.dump.channel_capacity == 0 {
            return Err(CanalError::config("channel capacities must be positive"));
        }
        if !self.dump.tables.is_empty() && self.dump.table_db.is_empty() {
            return Err(CanalError::config("dump.tables requires dump.table_db"));
        }
        if self.is_socket() {
            return Err(CanalError::config(
                "replication over a unix socket is not supported; use host:port",
            ));
        }
        self.host_port()?;
        Ok(())
    }

    /// Replication session settings derived from this config.
    pub fn syncer_config(&self) -> Result<SyncerConfig> {
        let (host, port) = self.host_port()?;
        let mut config = SyncerConfig::new(host, port, self.user.clone())
            .with_password(self.password.clone())
            .with_server_id(self.server_id)
            .with_flavor(self.flavor)
            .with_semi_sync(self.semi_sync_enabled);
        config.read_timeout = self.read_timeout();
        config.max_read_timeout = config.max_read_timeout.max(config.read_timeout);
        config.charset = self.charset.clone();
        config.heartbeat_period = self.heartbeat_period();
        config.max_reconnect_attempts = self.max_reconnect_attempts;
        config.disable_retry_sync = self.disable_retry_sync;
        config.event_channel_capacity = self.event_channel_capacity;
        Ok(config)
    }
}
