//! # mycanal - MySQL binlog replication and change data capture
//!
//! A fake-replica client for MySQL and MariaDB plus a CDC engine on top of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   mysqldump    ┌────────────┐
//! │  MySQL /   │───────────────▶│   Dumper   │──┐
//! │  MariaDB   │                └────────────┘  │ snapshot rows
//! │            │   binlog       ┌────────────┐  ▼
//! │            │───────────────▶│BinlogSyncer│─▶ Canal ─▶ EventHandler
//! └────────────┘                └────────────┘  ▲
//!       ▲           metadata / status queries   │
//!       └───────────────── CommandExecutor ─────┘
//! ```
//!
//! - [`mysql`] - wire protocol, binlog event codec, replication sessions
//! - [`canal`] - snapshot-then-stream orchestration, table metadata, DDL tracking
//! - [`dump`] - mysqldump driver and output parser
//! - [`common`] - errors, table filters, retry policies, state files
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mycanal::{Canal, CanalConfig, DummyEventHandler};
//! use std::sync::Arc;
//!
//! # async fn example() -> mycanal::Result<()> {
//! let config = CanalConfig::new("127.0.0.1:3306", "repl")
//!     .with_password("secret")
//!     .with_master_info_path("/var/lib/mycanal/master.json");
//!
//! let canal = Canal::new(config, Arc::new(DummyEventHandler)).await?;
//! canal.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod canal;
pub mod common;
pub mod dump;
pub mod mysql;

pub use canal::{
    Canal, CanalConfig, CanalState, DummyEventHandler, DumpConfig, EventHandler, GtidEventRef,
    RowsEvent, Table,
};
pub use common::{CanalError, CdcSource, ErrorCategory, Result, TableFilter, TableFilterConfig};
pub use mysql::{BinlogEvent, BinlogStreamer, BinlogSyncer, Flavor, GtidSet, Position, SyncerConfig};
