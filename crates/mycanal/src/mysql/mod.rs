//! MySQL/MariaDB replication client
//!
//! Supports:
//! - MySQL 5.6+, 8.0+ and MariaDB 10.x
//! - Row-based replication (binlog_format=ROW)
//! - File/position and GTID based dumps
//! - CRC32 checksummed binlogs
//! - Semi-synchronous acknowledgements
//!
//! # Architecture
//!
//! ```text
//! TCP → PacketConn → ReplicationConn → BinlogSyncer → BinlogParser → BinlogStreamer
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use mycanal::mysql::{BinlogSyncer, Position, SyncerConfig};
//!
//! # async fn example() -> mycanal::Result<()> {
//! let config = SyncerConfig::new("127.0.0.1", 3306, "repl")
//!     .with_password("secret")
//!     .with_server_id(1001);
//!
//! let mut syncer = BinlogSyncer::new(config);
//! let mut streamer = syncer.start_sync(Position::new("mysql-bin.000001", 4)).await?;
//! let event = streamer.get_event().await?;
//! println!("{:?}", event.event_type());
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod decoder;
pub mod encoder;
pub mod event;
pub mod gtid;
pub mod json;
pub mod packet;
pub mod position;
pub mod protocol;
pub mod syncer;

pub use decoder::{server_supports_checksum, BinlogParser};
pub use encoder::{BinlogFileWriter, EventEncoder};
pub use event::*;
pub use gtid::{Flavor, GtidSet, Interval, MariadbGtid, MariadbGtidSet, MysqlGtidSet, UuidSet};
pub use packet::PacketConn;
pub use position::{compare_binlog_file_name, Position, BINLOG_START_POSITION};
pub use protocol::{ReplicationConn, ResultSet};
pub use syncer::{
    BinlogStreamer, BinlogSyncer, Connector, ResumeCallback, StartPoint, SyncerConfig,
};
