//! Command connection for status queries and table metadata
//!
//! A single `mysql_async` connection, opened on first use and reopened when
//! the server drops it. Results are flattened into the same text
//! [`ResultSet`] the replication connection produces.

use crate::common::{CanalError, Result};
use crate::mysql::ResultSet;
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, Row, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Attempts per statement when the connection turns out to be broken.
pub const MAX_EXECUTE_ATTEMPTS: usize = 3;

/// Runs SQL statements for the canal.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<ResultSet>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// [`CommandExecutor`] backed by a lazily opened `mysql_async` connection.
pub struct MysqlCommandConn {
    opts: Opts,
    conn: Mutex<Option<Conn>>,
}

impl std::fmt::Debug for MysqlCommandConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlCommandConn")
            .field("host", &self.opts.ip_or_hostname())
            .field("port", &self.opts.tcp_port())
            .field("user", &self.opts.user())
            .finish_non_exhaustive()
    }
}

impl MysqlCommandConn {
    /// Build connection options; nothing is opened until the first statement.
    ///
    /// `addr` is `host:port` or a unix socket path.
    pub fn new(addr: &str, user: &str, password: &str, charset: &str) -> Result<Self> {
        let encoded_user = url::form_urlencoded::byte_serialize(user.as_bytes()).collect::<String>();
        let encoded_password =
            url::form_urlencoded::byte_serialize(password.as_bytes()).collect::<String>();

        // Keep the URL scoped so the embedded password is never logged.
        let opts = {
            let url = if addr.contains('/') {
                let socket = url::form_urlencoded::byte_serialize(addr.as_bytes()).collect::<String>();
                format!(
                    "mysql://{}:{}@localhost/?socket={}",
                    encoded_user, encoded_password, socket
                )
            } else {
                format!("mysql://{}:{}@{}/", encoded_user, encoded_password, addr)
            };
            Opts::from_url(&url)
                .map_err(|e| CanalError::config(format!("invalid command connection address: {}", e)))?
        };

        let opts = mysql_async::OptsBuilder::from_opts(opts)
            .init(vec![format!("SET NAMES {}", charset)])
            .into();

        Ok(Self {
            opts,
            conn: Mutex::new(None),
        })
    }
}

#[async_trait]
impl CommandExecutor for MysqlCommandConn {
    async fn execute(&self, sql: &str) -> Result<ResultSet> {
        let mut guard = self.conn.lock().await;
        let mut last_err = None;

        for attempt in 1..=MAX_EXECUTE_ATTEMPTS {
            if guard.is_none() {
                let conn = Conn::new(self.opts.clone()).await?;
                debug!(attempt, "command connection established");
                *guard = Some(conn);
            }
            let Some(conn) = guard.as_mut() else {
                continue;
            };

            match run_query(conn, sql).await {
                Ok(result) => return Ok(result),
                Err(e) if matches!(e, CanalError::ConnectionBroken(_)) => {
                    warn!(attempt, error = %e, "command connection broken, reconnecting");
                    *guard = None;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| CanalError::query(format!("failed to execute '{}'", sql))))
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.disconnect().await?;
        }
        Ok(())
    }
}

async fn run_query(conn: &mut Conn, sql: &str) -> Result<ResultSet> {
    let mut result = conn.query_iter(sql).await?;
    let columns = result
        .columns()
        .map(|cols| cols.iter().map(|c| c.name_str().into_owned()).collect())
        .unwrap_or_default();
    let rows: Vec<Row> = result.collect().await?;
    result.drop_result().await?;

    let rows = rows
        .iter()
        .map(|row| {
            (0..row.len())
                .map(|i| row.as_ref(i).and_then(value_to_text))
                .collect()
        })
        .collect();
    Ok(ResultSet { columns, rows })
}

/// Text rendering of a driver value; `None` for SQL NULL.
fn value_to_text(value: &Value) -> Option<String> {
    Some(match value {
        Value::NULL => return None,
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Date(y, m, d, h, mi, s, us) => {
            if *us > 0 {
                format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}", y, m, d, h, mi, s, us)
            } else {
                format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, m, d, h, mi, s)
            }
        }
        Value::Time(neg, days, h, mi, s, us) => {
            let hours = u32::from(*h) + days * 24;
            let sign = if *neg { "-" } else { "" };
            if *us > 0 {
                format!("{}{:02}:{:02}:{:02}.{:06}", sign, hours, mi, s, us)
            } else {
                format!("{}{:02}:{:02}:{:02}", sign, hours, mi, s)
            }
        }
    })
}
