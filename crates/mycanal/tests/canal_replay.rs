//! Canal dispatch over a recorded binlog
//!
//! Events read from a binlog file are fed through a `BinlogStreamer`
//! channel, exercising the same path as a live session without a server.

mod harness;

use harness::{init_test_logging, write_users_binlog, MetadataExecutor, RecordingHandler};
use mycanal::canal::MasterRecord;
use mycanal::common::load_json;
use mycanal::mysql::{BinlogParser, BinlogStreamer, RowValue, RowsAction};
use mycanal::{Canal, CanalConfig, CanalError, CanalState, Position};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stream every event of `path` into the canal; the stream ends like a
/// dropped connection.
async fn replay_file(canal: &Canal, path: &Path) -> mycanal::Result<()> {
    let (tx, streamer) = BinlogStreamer::channel(4, CancellationToken::new());

    let path = path.to_path_buf();
    let producer = tokio::spawn(async move {
        let mut events = Vec::new();
        BinlogParser::new()
            .parse_file(&path, 4, |event| {
                events.push(event);
                Ok(())
            })
            .await?;
        for event in events {
            if tx.send(Ok(event)).await.is_err() {
                break;
            }
        }
        Ok::<_, CanalError>(())
    });

    let result = canal.run_with_streamer(streamer).await;
    producer.await.unwrap()?;
    match result {
        Err(CanalError::ConnectionBroken(_)) => Ok(()),
        other => other,
    }
}

fn config(dir: &Path) -> CanalConfig {
    CanalConfig::new("127.0.0.1:3306", "repl")
        .without_dump()
        .with_master_info_path(dir.join("master.json"))
}

#[tokio::test]
async fn test_replay_delivers_rows_and_positions() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let binlog = write_users_binlog(dir.path(), true).await;

    let handler = Arc::new(RecordingHandler::default());
    let exec = Arc::new(MetadataExecutor::with_users_table());
    let canal = Canal::with_executor(config(dir.path()), handler.clone(), exec.clone())
        .await
        .unwrap();
    canal.master().update(Position::new("mysql-bin.000001", 4));

    replay_file(&canal, &binlog).await.unwrap();

    assert_eq!(
        handler.calls_starting_with("table_changed"),
        vec!["table_changed test.users"]
    );
    assert_eq!(
        handler.calls_starting_with("ddl"),
        vec!["ddl ALTER TABLE users ADD COLUMN visits BIGINT UNSIGNED"]
    );
    assert_eq!(
        handler.calls_starting_with("row"),
        vec!["row insert test.users", "row update test.users"]
    );
    assert_eq!(handler.calls_starting_with("gtid").len(), 3);
    assert_eq!(handler.calls_starting_with("xid").len(), 2);
    assert_eq!(handler.calls_starting_with("rotate"), vec!["rotate mysql-bin.000002"]);

    // rows are bound to the fetched metadata
    let rows = handler.rows();
    assert_eq!(rows[0].action, RowsAction::Insert);
    assert_eq!(rows[0].table.pk_columns, vec![0]);
    assert_eq!(rows[0].rows[1][2], RowValue::UInt64(u64::MAX));
    assert_eq!(rows[1].action, RowsAction::Update);
    assert_eq!(rows[1].rows.len(), 2);
    assert_eq!(rows[1].rows[1][2], RowValue::UInt64(1));

    // metadata is fetched once per table
    let fetches = exec
        .executed()
        .into_iter()
        .filter(|sql| sql.starts_with("SHOW FULL COLUMNS"))
        .count();
    assert_eq!(fetches, 1);

    assert_eq!(canal.synced_position(), Position::new("mysql-bin.000002", 4));
    assert_eq!(
        handler.calls().last().map(String::as_str),
        Some("pos_synced (mysql-bin.000002, 4) force=true")
    );
    // events carry an old timestamp
    assert!(canal.get_delay() > 0);

    canal.close().await;
    assert_eq!(canal.state(), CanalState::Closed);
    let record: MasterRecord = load_json(&dir.path().join("master.json"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.bin_name, "mysql-bin.000002");
    assert_eq!(record.bin_pos, 4);
    assert_eq!(record.addr, "127.0.0.1:3306");
}

#[tokio::test]
async fn test_replay_with_excluded_table() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let binlog = write_users_binlog(dir.path(), false).await;

    let handler = Arc::new(RecordingHandler::default());
    let exec = Arc::new(MetadataExecutor::with_users_table());
    let canal = Canal::with_executor(
        config(dir.path()).exclude_table(r"test\..*"),
        handler.clone(),
        exec.clone(),
    )
    .await
    .unwrap();

    replay_file(&canal, &binlog).await.unwrap();

    assert!(handler.calls_starting_with("row").is_empty());
    // DDL notifications are not filtered
    assert_eq!(handler.calls_starting_with("ddl").len(), 1);
    assert_eq!(handler.calls_starting_with("xid").len(), 2);
    assert!(exec.executed().is_empty());
    assert_eq!(canal.synced_position().name, "mysql-bin.000002");
}

#[tokio::test]
async fn test_second_run_is_a_no_op_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let binlog = write_users_binlog(dir.path(), false).await;

    let handler = Arc::new(RecordingHandler::default());
    let canal = Canal::with_executor(
        config(dir.path()),
        handler.clone(),
        Arc::new(MetadataExecutor::with_users_table()),
    )
    .await
    .unwrap();

    replay_file(&canal, &binlog).await.unwrap();
    let calls = handler.calls().len();

    // a stopped canal does not process another stream
    replay_file(&canal, &binlog).await.unwrap();
    assert_eq!(handler.calls().len(), calls);
}
