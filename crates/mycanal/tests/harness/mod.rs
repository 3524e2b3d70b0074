//! Shared fixtures for mycanal integration tests
//!
//! - Logging setup
//! - A metadata executor answering from fixed result sets
//! - A handler recording every callback
//! - Synthetic binlog files for the `test`.`users` table
//! - Connection settings for the live-server tests

#![allow(dead_code)]

use async_trait::async_trait;
use mycanal::canal::{CommandExecutor, RowsEvent};
use mycanal::mysql::{
    BinlogFileWriter, EventEncoder, EventHeader, QueryEvent, ResultSet, RotateEvent, RowValue,
    RowsAction, TableMapEvent,
};
use mycanal::{CanalError, EventHandler, GtidEventRef, GtidSet, Position, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("mycanal=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const SOURCE_UUID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

pub fn source_uuid() -> Uuid {
    Uuid::parse_str(SOURCE_UUID).unwrap()
}

fn result_set(columns: &[&str], rows: Vec<Vec<Option<&str>>>) -> ResultSet {
    ResultSet {
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows: rows
            .into_iter()
            .map(|row| row.into_iter().map(|v| v.map(str::to_string)).collect())
            .collect(),
    }
}

/// Executor serving table metadata; everything else returns an empty set.
#[derive(Default)]
pub struct MetadataExecutor {
    responses: Mutex<HashMap<String, ResultSet>>,
    executed: Mutex<Vec<String>>,
}

impl MetadataExecutor {
    /// Metadata for `test`.`users (id INT PK, name VARCHAR(64), visits BIGINT UNSIGNED)`.
    pub fn with_users_table() -> Self {
        let exec = Self::default();
        exec.respond(
            "SHOW FULL COLUMNS FROM `test`.`users`",
            result_set(
                &["Field", "Type", "Collation", "Null", "Key", "Default", "Extra"],
                vec![
                    vec![Some("id"), Some("int"), None, Some("NO"), Some("PRI"), None, Some("")],
                    vec![
                        Some("name"),
                        Some("varchar(64)"),
                        Some("utf8mb4_0900_ai_ci"),
                        Some("YES"),
                        Some(""),
                        None,
                        Some(""),
                    ],
                    vec![
                        Some("visits"),
                        Some("bigint unsigned"),
                        None,
                        Some("YES"),
                        Some(""),
                        None,
                        Some(""),
                    ],
                ],
            ),
        );
        exec.respond(
            "SHOW INDEX FROM `test`.`users`",
            result_set(
                &["Table", "Non_unique", "Key_name", "Seq_in_index", "Column_name", "Cardinality"],
                vec![vec![Some("users"), Some("0"), Some("PRIMARY"), Some("1"), Some("id"), Some("3")]],
            ),
        );
        exec
    }

    pub fn respond(&self, sql: &str, result: ResultSet) {
        self.responses.lock().unwrap().insert(sql.to_string(), result);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for MetadataExecutor {
    async fn execute(&self, sql: &str) -> Result<ResultSet> {
        self.executed.lock().unwrap().push(sql.to_string());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(sql)
            .cloned()
            .unwrap_or_default())
    }
}

/// Handler recording callbacks as short text lines.
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<String>>,
    rows: Mutex<Vec<RowsEvent>>,
}

impl RecordingHandler {
    fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn rows(&self) -> Vec<RowsEvent> {
        self.rows.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_rotate(&self, _header: &EventHeader, rotate: &RotateEvent) -> Result<()> {
        self.push(format!("rotate {}", rotate.next_log_name));
        Ok(())
    }

    async fn on_table_changed(&self, _header: &EventHeader, schema: &str, table: &str) -> Result<()> {
        self.push(format!("table_changed {}.{}", schema, table));
        Ok(())
    }

    async fn on_ddl(&self, _header: &EventHeader, _pos: &Position, query: &QueryEvent) -> Result<()> {
        self.push(format!("ddl {}", query.query));
        Ok(())
    }

    async fn on_row(&self, event: &RowsEvent) -> Result<()> {
        self.push(format!("row {} {}", event.action.as_str(), event.table));
        self.rows.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn on_xid(&self, _header: &EventHeader, pos: &Position) -> Result<()> {
        self.push(format!("xid {}", pos));
        Ok(())
    }

    async fn on_gtid(&self, _header: &EventHeader, gtid: GtidEventRef<'_>) -> Result<()> {
        self.push(format!("gtid {}", gtid.gtid_next()));
        Ok(())
    }

    async fn on_pos_synced(
        &self,
        _header: Option<&EventHeader>,
        pos: &Position,
        _gtid_set: Option<&GtidSet>,
        force: bool,
    ) -> Result<()> {
        self.push(format!("pos_synced {} force={}", pos, force));
        Ok(())
    }

    fn is_ddl_error_recoverable(&self, _err: &CanalError) -> bool {
        false
    }
}

pub fn users_table() -> TableMapEvent {
    TableMapEvent {
        table_id: 100,
        flags: 1,
        schema: "test".into(),
        table: "users".into(),
        column_count: 3,
        column_types: vec![3, 15, 8],
        column_meta: vec![0, 256, 0],
        null_bitmap: vec![0b0000_0110],
        signedness_bitmap: Some(vec![0b0100_0000]),
        column_names: vec!["id".into(), "name".into(), "visits".into()],
        primary_key: vec![0],
    }
}

pub fn user_row(id: i32, name: &str, visits: u64) -> Vec<RowValue> {
    vec![
        RowValue::Int32(id),
        RowValue::String(name.to_string()),
        RowValue::UInt64(visits),
    ]
}

/// Write `mysql-bin.000001` holding a DDL, an insert of two users, an
/// update of one of them, and a rotate to `mysql-bin.000002`. With `gtids`,
/// every transaction is preceded by a GTID event.
pub async fn write_users_binlog(dir: &Path, gtids: bool) -> std::path::PathBuf {
    let path = dir.join("mysql-bin.000001");
    let encoder = EventEncoder::new(1).with_timestamp(1_700_000_000);
    let table = users_table();
    let mut gno = 0;
    let mut gtid = |events: &mut Vec<bytes::Bytes>| {
        if gtids {
            gno += 1;
            events.push(encoder.gtid(source_uuid(), gno, gno - 1, gno));
        }
    };

    let mut events = vec![encoder.format_description("8.0.36-log")];
    gtid(&mut events);
    events.push(encoder.query("test", "ALTER TABLE users ADD COLUMN visits BIGINT UNSIGNED"));

    gtid(&mut events);
    events.push(encoder.query("test", "BEGIN"));
    events.push(encoder.table_map(&table).unwrap());
    events.push(
        encoder
            .rows(
                2,
                RowsAction::Insert,
                &table,
                &[user_row(1, "alice", 0), user_row(2, "bob", u64::MAX)],
            )
            .unwrap(),
    );
    events.push(encoder.xid(10));

    gtid(&mut events);
    events.push(encoder.query("test", "BEGIN"));
    events.push(encoder.table_map(&table).unwrap());
    events.push(
        encoder
            .rows(
                2,
                RowsAction::Update,
                &table,
                &[user_row(1, "alice", 0), user_row(1, "alice", 1)],
            )
            .unwrap(),
    );
    events.push(encoder.xid(11));
    events.push(encoder.rotate("mysql-bin.000002", 4));

    let mut writer = BinlogFileWriter::create(&path).await.unwrap();
    for event in &events {
        writer.append(event).await.unwrap();
    }
    writer.finish().await.unwrap();
    path
}

/// Connection settings for tests against a real server.
///
/// The server needs `log_bin`, `binlog_format=ROW` and `gtid_mode=ON`.
pub struct LiveServer {
    pub addr: String,
    pub user: String,
    pub password: String,
}

impl LiveServer {
    pub fn from_env() -> Self {
        Self {
            addr: std::env::var("MYCANAL_TEST_ADDR").unwrap_or_else(|_| "127.0.0.1:3306".into()),
            user: std::env::var("MYCANAL_TEST_USER").unwrap_or_else(|_| "root".into()),
            password: std::env::var("MYCANAL_TEST_PASSWORD").unwrap_or_default(),
        }
    }

    pub fn host_port(&self) -> (String, u16) {
        match self.addr.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap()),
            None => (self.addr.clone(), 3306),
        }
    }
}
