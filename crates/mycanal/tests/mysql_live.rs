//! Tests against a running MySQL server
//!
//! Configure with `MYCANAL_TEST_ADDR`, `MYCANAL_TEST_USER` and
//! `MYCANAL_TEST_PASSWORD`. The server needs row-based binary logging and
//! GTIDs enabled:
//!
//! ```text
//! mysqld --server-id=1 --log-bin=mysql-bin --binlog-format=ROW \
//!        --gtid-mode=ON --enforce-gtid-consistency=ON
//! ```

mod harness;

use harness::{init_test_logging, LiveServer, RecordingHandler};
use mycanal::canal::{CommandExecutor, MysqlCommandConn};
use mycanal::mysql::{EventData, RowsAction};
use mycanal::{
    BinlogSyncer, Canal, CanalConfig, CanalState, CdcSource, Flavor, Position, SyncerConfig,
};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DATABASE: &str = "mycanal_it";

async fn admin(server: &LiveServer) -> MysqlCommandConn {
    let conn = MysqlCommandConn::new(&server.addr, &server.user, &server.password, "utf8mb4").unwrap();
    for sql in [
        format!("CREATE DATABASE IF NOT EXISTS {}", DATABASE),
        format!("DROP TABLE IF EXISTS {}.users", DATABASE),
        format!(
            "CREATE TABLE {}.users (id INT PRIMARY KEY, name VARCHAR(64), visits BIGINT UNSIGNED)",
            DATABASE
        ),
    ] {
        conn.execute(&sql).await.unwrap();
    }
    conn
}

fn canal_config(server: &LiveServer) -> CanalConfig {
    CanalConfig::new(server.addr.clone(), server.user.clone())
        .with_password(server.password.clone())
        .with_server_id(54_321)
        .include_table(format!(r"{}\..*", DATABASE))
        .without_dump()
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
#[ignore = "Requires MySQL; run with --ignored"]
#[serial]
async fn test_syncer_streams_rows() {
    init_test_logging();
    let server = LiveServer::from_env();
    let admin = admin(&server).await;

    let canal = Canal::new(canal_config(&server), Arc::new(RecordingHandler::default()))
        .await
        .unwrap();
    let start = canal.get_master_pos().await.unwrap();
    info!("streaming from {}", start);

    let (host, port) = server.host_port();
    let config = SyncerConfig::new(host, port, server.user.clone())
        .with_password(server.password.clone())
        .with_server_id(54_322)
        .with_flavor(Flavor::MySql);
    let mut syncer = BinlogSyncer::new(config);
    let mut streamer = syncer.start_sync(start.clone()).await.unwrap();

    admin
        .execute(&format!("INSERT INTO {}.users VALUES (1, 'alice', 3)", DATABASE))
        .await
        .unwrap();

    let mut saw_fake_rotate = false;
    loop {
        let event = streamer
            .get_event_timeout(Duration::from_secs(10))
            .await
            .unwrap()
            .expect("no event within 10s");
        match &event.event {
            EventData::Rotate(r) if event.header.log_pos == 0 => {
                assert_eq!(r.next_log_name, start.name);
                saw_fake_rotate = true;
            }
            EventData::Rows(rows) => {
                assert_eq!(rows.action, RowsAction::Insert);
                assert_eq!(rows.table.table, "users");
                assert_eq!(rows.rows.len(), 1);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_fake_rotate);

    syncer.close().await;
    canal.close().await;
    admin.close().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires MySQL; run with --ignored"]
#[serial]
async fn test_canal_follows_changes() {
    init_test_logging();
    let server = LiveServer::from_env();
    let admin = admin(&server).await;
    let dir = tempfile::tempdir().unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let canal = Canal::new(
        canal_config(&server).with_master_info_path(dir.path().join("master.json")),
        handler.clone(),
    )
    .await
    .unwrap();
    canal.check_binlog_row_image("FULL").await.unwrap();

    let start = canal.get_master_pos().await.unwrap();
    canal.master().update(start.clone());

    let mut source = canal.clone();
    source.start().await.unwrap();

    for sql in [
        format!("INSERT INTO {}.users VALUES (1, 'alice', 0), (2, 'bob', 0)", DATABASE),
        format!("UPDATE {}.users SET visits = visits + 1 WHERE id = 1", DATABASE),
        format!("DELETE FROM {}.users WHERE id = 2", DATABASE),
        format!("ALTER TABLE {}.users ADD COLUMN email VARCHAR(128)", DATABASE),
    ] {
        admin.execute(&sql).await.unwrap();
    }

    canal.catch_master_pos(Duration::from_secs(10)).await.unwrap();
    wait_for("ddl", || !handler.calls_starting_with("ddl").is_empty()).await;

    assert_eq!(
        handler.calls_starting_with("row"),
        vec![
            format!("row insert {}.users", DATABASE),
            format!("row update {}.users", DATABASE),
            format!("row delete {}.users", DATABASE),
        ]
    );
    assert_eq!(
        handler.calls_starting_with("table_changed"),
        vec![format!("table_changed {}.users", DATABASE)]
    );
    assert!(canal.synced_position().compare(&start).is_gt());
    assert!(canal.synced_gtid_set().is_none());
    assert_eq!(canal.state(), CanalState::Streaming);
    assert!(source.is_healthy().await);

    source.stop().await.unwrap();
    assert_eq!(canal.state(), CanalState::Closed);
    admin.close().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires MySQL; run with --ignored"]
#[serial]
async fn test_gtid_start_from_executed_set() {
    init_test_logging();
    let server = LiveServer::from_env();
    let admin = admin(&server).await;

    let handler = Arc::new(RecordingHandler::default());
    let canal = Canal::new(canal_config(&server), handler.clone()).await.unwrap();
    let executed = canal.get_master_gtid_set().await.unwrap();
    assert!(!executed.is_empty());

    let runner = canal.clone();
    let task = tokio::spawn(async move { runner.start_from_gtid(executed).await });

    admin
        .execute(&format!("INSERT INTO {}.users VALUES (7, 'gtid', 1)", DATABASE))
        .await
        .unwrap();

    wait_for("row", || !handler.calls_starting_with("row").is_empty()).await;
    assert_eq!(handler.calls_starting_with("gtid").len(), 1);
    wait_for("xid", || !handler.calls_starting_with("xid").is_empty()).await;
    assert!(canal.synced_gtid_set().is_some());

    canal.close().await;
    task.await.unwrap().unwrap();
    admin.close().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires MySQL; run with --ignored"]
#[serial]
async fn test_wait_until_current_position() {
    init_test_logging();
    let server = LiveServer::from_env();
    let _admin = admin(&server).await;

    let canal = Canal::new(canal_config(&server), Arc::new(RecordingHandler::default()))
        .await
        .unwrap();
    let start = canal.get_master_pos().await.unwrap();
    canal.master().update(start);

    let runner = canal.clone();
    let task = tokio::spawn(async move { runner.run().await });

    let target: Position = canal.get_master_pos().await.unwrap();
    canal
        .wait_until_pos(&target, Duration::from_secs(10))
        .await
        .unwrap();

    canal.close().await;
    task.await.unwrap().unwrap();
}
