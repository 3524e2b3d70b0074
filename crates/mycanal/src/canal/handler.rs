//! Callbacks invoked by the canal
//!
//! Every method has a no-op default, so a handler implements only the
//! notifications it cares about. Returning an error stops the canal, except
//! from [`EventHandler::on_ddl`] when [`EventHandler::is_ddl_error_recoverable`]
//! accepts it.

use super::rows::RowsEvent;
use crate::common::{CanalError, Result};
use crate::mysql::{
    EventHeader, GtidEvent, GtidSet, MariadbGtidEvent, Position, QueryEvent, RotateEvent,
    RowsQueryEvent,
};
use async_trait::async_trait;

/// Transaction identifier announced before a transaction's events
#[derive(Debug, Clone, Copy)]
pub enum GtidEventRef<'a> {
    MySql(&'a GtidEvent),
    MariaDb(&'a MariadbGtidEvent),
}

impl GtidEventRef<'_> {
    /// Text form of the GTID, `uuid:gno` or `domain-server-seq`.
    pub fn gtid_next(&self) -> String {
        match self {
            GtidEventRef::MySql(e) => e.gtid(),
            GtidEventRef::MariaDb(e) => e.gtid.to_string(),
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Binlog switched to a new file.
    async fn on_rotate(&self, _header: &EventHeader, _rotate: &RotateEvent) -> Result<()> {
        Ok(())
    }

    /// A DDL statement is about to change `schema.table`.
    ///
    /// Called before the cached metadata is dropped; returning an error
    /// vetoes the change and stops the canal.
    async fn on_table_changed(
        &self,
        _header: &EventHeader,
        _schema: &str,
        _table: &str,
    ) -> Result<()> {
        Ok(())
    }

    /// A table-changing DDL statement has been applied.
    async fn on_ddl(
        &self,
        _header: &EventHeader,
        _next_pos: &Position,
        _query: &QueryEvent,
    ) -> Result<()> {
        Ok(())
    }

    /// Rows were inserted, updated or deleted.
    async fn on_row(&self, _event: &RowsEvent) -> Result<()> {
        Ok(())
    }

    /// A transaction committed.
    async fn on_xid(&self, _header: &EventHeader, _next_pos: &Position) -> Result<()> {
        Ok(())
    }

    async fn on_gtid(&self, _header: &EventHeader, _gtid: GtidEventRef<'_>) -> Result<()> {
        Ok(())
    }

    /// Coordinates advanced. `header` is `None` after the dump and on close.
    async fn on_pos_synced(
        &self,
        _header: Option<&EventHeader>,
        _pos: &Position,
        _gtid_set: Option<&GtidSet>,
        _force: bool,
    ) -> Result<()> {
        Ok(())
    }

    /// Original statement text of the following rows events.
    async fn on_rows_query(&self, _header: &EventHeader, _event: &RowsQueryEvent) -> Result<()> {
        Ok(())
    }

    /// Whether a failed [`EventHandler::on_ddl`] may be logged and skipped.
    fn is_ddl_error_recoverable(&self, _err: &CanalError) -> bool {
        false
    }

    fn name(&self) -> &str {
        "EventHandler"
    }
}

/// Handler that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyEventHandler;

impl EventHandler for DummyEventHandler {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql::{EventType, MariadbGtid};
    use uuid::Uuid;

    fn header() -> EventHeader {
        EventHeader {
            timestamp: 0,
            event_type: EventType::Xid,
            server_id: 1,
            event_size: 31,
            log_pos: 100,
            flags: 0,
        }
    }

    #[tokio::test]
    async fn test_dummy_handler_accepts_everything() {
        let handler = DummyEventHandler;
        let pos = Position::new("mysql-bin.000001", 100);
        assert!(handler.on_xid(&header(), &pos).await.is_ok());
        assert!(handler
            .on_pos_synced(None, &pos, None, true)
            .await
            .is_ok());
        assert!(!handler.is_ddl_error_recoverable(&CanalError::handler("x")));
        assert_eq!(handler.name(), "EventHandler");
    }

    #[test]
    fn test_gtid_event_ref_text() {
        let sid = Uuid::parse_str("3e11fa47-71ca-11e1-9e33-c80aa9429562").unwrap();
        let mysql = GtidEvent {
            commit_flag: 1,
            sid,
            gno: 23,
            last_committed: None,
            sequence_number: None,
            tag: None,
            anonymous: false,
        };
        assert_eq!(
            GtidEventRef::MySql(&mysql).gtid_next(),
            "3e11fa47-71ca-11e1-9e33-c80aa9429562:23"
        );

        let maria = MariadbGtidEvent {
            gtid: MariadbGtid {
                domain_id: 0,
                server_id: 1,
                sequence_number: 9,
            },
            flags: 0,
        };
        assert_eq!(GtidEventRef::MariaDb(&maria).gtid_next(), "0-1-9");
    }
}
