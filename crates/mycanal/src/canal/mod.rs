//! # Canal
//!
//! Change data capture on top of the replication client. A [`Canal`] first
//! takes a consistent snapshot with mysqldump (when it has no stored
//! coordinates), then follows the binlog from the snapshot's position and
//! hands every change to an [`EventHandler`].
//!
//! ## Lifecycle
//!
//! ```text
//! Created → SnapshotDump → Streaming → Closing → Closed
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use mycanal::canal::{Canal, CanalConfig, EventHandler, RowsEvent};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl EventHandler for Printer {
//!     async fn on_row(&self, event: &RowsEvent) -> mycanal::Result<()> {
//!         println!("{}", event);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> mycanal::Result<()> {
//! let config = CanalConfig::new("127.0.0.1:3306", "root")
//!     .with_password("secret")
//!     .include_table(r"shop\..*");
//! let canal = Canal::new(config, Arc::new(Printer)).await?;
//! canal.run().await?;
//! # Ok(())
//! # }
//! ```

mod command;
mod config;
mod ddl;
mod handler;
mod master;
mod rows;
mod schema;

pub use command::{CommandExecutor, MysqlCommandConn, MAX_EXECUTE_ATTEMPTS};
pub use config::{CanalConfig, DumpConfig};
pub use ddl::{DdlChange, DdlKind, DdlParser, ExprEvaluator, PlaceholderEvaluator, TableRef};
pub use handler::{DummyEventHandler, EventHandler, GtidEventRef};
pub use master::{MasterInfo, MasterRecord};
pub use rows::RowsEvent;
pub use schema::{quote_identifier, ColumnKind, Index, Table, TableColumn, HA_HEALTH_CHECK_TABLE};

use crate::common::{CanalError, CdcSource, Result, TableFilter};
use crate::dump::{unescape_string, DumpItem, Dumper};
use crate::mysql::{
    BinlogEvent, BinlogRowsEvent, BinlogStreamer, BinlogSyncer, EventData, EventHeader, Flavor,
    GtidSet, Position, ResultSet, RowValue, RowsAction, StartPoint,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a table whose metadata could not be fetched is reported as
/// missing before the fetch is retried.
pub const UNKNOWN_TABLE_RETRY_PERIOD: Duration = Duration::from_secs(600);

/// Poll interval of [`Canal::wait_until_pos`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanalState {
    Created,
    SnapshotDump,
    Streaming,
    Closing,
    Closed,
}

struct CanalInner {
    config: CanalConfig,
    handler: Arc<dyn EventHandler>,
    master: Arc<MasterInfo>,
    filter: TableFilter,
    ddl: DdlParser,
    tables: Mutex<HashMap<String, Arc<Table>>>,
    error_tables: Mutex<HashMap<String, Instant>>,
    command: Arc<dyn CommandExecutor>,
    syncer: tokio::sync::Mutex<Option<BinlogSyncer>>,
    cancel: CancellationToken,
    dump_done: watch::Sender<bool>,
    delay: AtomicU32,
    dumped: AtomicBool,
    closed: AtomicBool,
    running: AtomicBool,
    state: RwLock<CanalState>,
    run_lock: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

/// Snapshot-then-stream change data capture engine.
///
/// Cloning is cheap; clones share one engine, so a clone can `close()`
/// the canal while another runs it.
#[derive(Clone)]
pub struct Canal {
    inner: Arc<CanalInner>,
}

impl std::fmt::Debug for Canal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canal")
            .field("config", &self.inner.config)
            .field("handler", &self.inner.handler.name())
            .field("state", &self.state())
            .field("position", &self.inner.master.position())
            .finish_non_exhaustive()
    }
}

impl Canal {
    /// Canal talking to `config.addr`.
    ///
    /// Loads stored coordinates from `config.master_info_path`; no
    /// connection is opened until the canal runs or a query is executed.
    pub async fn new(config: CanalConfig, handler: Arc<dyn EventHandler>) -> Result<Self> {
        let command = MysqlCommandConn::new(
            &config.addr,
            &config.user,
            &config.password,
            &config.charset,
        )?;
        Self::with_executor(config, handler, Arc::new(command)).await
    }

    /// Canal running its queries through `command`.
    pub async fn with_executor(
        config: CanalConfig,
        handler: Arc<dyn EventHandler>,
        command: Arc<dyn CommandExecutor>,
    ) -> Result<Self> {
        if config.addr.is_empty() || config.user.is_empty() {
            return Err(CanalError::config("addr and user must be set"));
        }
        let filter = TableFilter::new(&config.table_filter())?;
        let master = MasterInfo::load(
            config.master_info_path.clone(),
            config.addr.clone(),
            config.flavor,
            config.master_info_flush_interval(),
        )
        .await?;
        let (dump_done, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(CanalInner {
                config,
                handler,
                master: Arc::new(master),
                filter,
                ddl: DdlParser::default(),
                tables: Mutex::new(HashMap::new()),
                error_tables: Mutex::new(HashMap::new()),
                command,
                syncer: tokio::sync::Mutex::new(None),
                cancel: CancellationToken::new(),
                dump_done,
                delay: AtomicU32::new(0),
                dumped: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                running: AtomicBool::new(false),
                state: RwLock::new(CanalState::Created),
                run_lock: tokio::sync::Mutex::new(()),
                task: Mutex::new(None),
            }),
        })
    }

    /// Replace the DDL parser, e.g. to plug in another [`ExprEvaluator`].
    ///
    /// Only possible before the canal is shared.
    pub fn with_ddl_parser(mut self, ddl: DdlParser) -> Result<Self> {
        let inner = Arc::get_mut(&mut self.inner)
            .ok_or_else(|| CanalError::invariant("canal is already shared"))?;
        inner.ddl = ddl;
        Ok(self)
    }

    pub fn config(&self) -> &CanalConfig {
        &self.inner.config
    }

    pub fn master(&self) -> &Arc<MasterInfo> {
        &self.inner.master
    }

    pub fn state(&self) -> CanalState {
        self.inner
            .state
            .read()
            .map(|s| *s)
            .unwrap_or(CanalState::Closed)
    }

    fn set_state(&self, state: CanalState) {
        if let Ok(mut current) = self.inner.state.write() {
            if *current != CanalState::Closed {
                *current = state;
            }
        }
    }

    // ------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------

    /// Dump (when needed) and then stream until closed or a fatal error.
    ///
    /// Returns `Ok(())` when stopped by [`Canal::close`].
    pub async fn run(&self) -> Result<()> {
        self.guarded(self.run_inner()).await
    }

    /// Start from `position`, ignoring stored coordinates.
    pub async fn run_from(&self, position: Position) -> Result<()> {
        self.inner.master.update(position);
        self.run().await
    }

    /// Start from a GTID set.
    ///
    /// An empty set still selects GTID mode: the dump records the server's
    /// executed set and streaming continues from it.
    pub async fn start_from_gtid(&self, gtid_set: GtidSet) -> Result<()> {
        self.inner.master.update_gtid_set(gtid_set);
        self.run().await
    }

    /// Process events from an externally fed streamer, without dump or
    /// server connection.
    ///
    /// Used to replay binlog files and fixtures through the same dispatch
    /// path as a live session.
    pub async fn run_with_streamer(&self, streamer: BinlogStreamer) -> Result<()> {
        self.set_state(CanalState::Streaming);
        self.guarded(self.handle_stream(streamer)).await
    }

    async fn guarded(&self, work: impl Future<Output = Result<()>>) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Ok(());
        }
        let _running = self
            .inner
            .run_lock
            .try_lock()
            .map_err(|_| CanalError::invariant("canal is already running"))?;
        self.inner.running.store(true, Ordering::SeqCst);

        let result = work.await;

        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();
        match result {
            Ok(()) | Err(CanalError::Cancelled) => Ok(()),
            Err(e) => {
                error!("canal stopped: {}", e);
                Err(e)
            }
        }
    }

    async fn run_inner(&self) -> Result<()> {
        self.inner.master.update_timestamp(unix_now());

        if !self.inner.dumped.swap(true, Ordering::SeqCst) {
            self.set_state(CanalState::SnapshotDump);
            let dumped = self.try_dump().await;
            self.inner.dump_done.send_replace(true);
            if let Err(e) = dumped {
                if !matches!(e, CanalError::Cancelled) {
                    error!("canal dump mysql err: {}", e);
                }
                return Err(e);
            }
        }

        self.check_binlog_row_format().await?;
        let streamer = self.start_syncer().await?;
        self.set_state(CanalState::Streaming);
        self.handle_stream(streamer).await
    }

    async fn start_syncer(&self) -> Result<BinlogStreamer> {
        let mut syncer = BinlogSyncer::new(self.inner.config.syncer_config()?)
            .with_parent_token(&self.inner.cancel);
        let master = self.inner.master.clone();
        syncer.set_resume_callback(Arc::new(move || resume_point(&master)));

        let streamer = match self.inner.master.gtid_set().filter(|g| !g.is_empty()) {
            Some(gtid_set) => syncer.start_sync_gtid(gtid_set).await?,
            None => syncer.start_sync(self.inner.master.position()).await?,
        };
        *self.inner.syncer.lock().await = Some(syncer);
        Ok(streamer)
    }

    async fn handle_stream(&self, mut streamer: BinlogStreamer) -> Result<()> {
        let mut fake_rotate_log_name: Option<String> = None;

        loop {
            let BinlogEvent { header, event, .. } = streamer.get_event().await?;
            self.update_replication_delay(&header);

            // The server announces the file it streams from with a rotate
            // event whose log_pos is zero. It is not part of the binlog.
            if header.log_pos == 0 {
                if let EventData::Rotate(rotate) = &event {
                    info!("received fake rotate event, next log name is {}", rotate.next_log_name);
                    fake_rotate_log_name = Some(rotate.next_log_name.clone());
                }
                continue;
            }

            let synced = self.inner.master.position();
            let mut pos = synced.clone();
            pos.pos = header.log_pos;
            if let Some(name) = &fake_rotate_log_name {
                pos.name.clone_from(name);
            }
            if let EventData::Rotate(rotate) = &event {
                pos = Position::new(rotate.next_log_name.clone(), rotate.position as u32);
            }

            // Rotates, commits and DDL at the stored position were already
            // applied.
            if pos == synced
                && matches!(
                    event,
                    EventData::Rotate(_) | EventData::Xid(_) | EventData::Query(_)
                )
            {
                debug!("skip {:?} event at {}, already processed", header.event_type, pos);
                continue;
            }

            let mut save = false;
            let mut force = false;

            match event {
                EventData::Rotate(rotate) => {
                    info!("rotate binlog to {}", pos);
                    save = true;
                    force = true;
                    self.inner.handler.on_rotate(&header, &rotate).await?;
                }
                EventData::Rows(rows) => {
                    if let Err(e) = self.handle_rows_event(&header, rows).await {
                        if !e.is_skippable_table_error() {
                            error!("handle rows event at {} error: {}", pos, e);
                            return Err(e);
                        }
                        debug!(error = %e, "rows event skipped");
                    }
                    continue;
                }
                EventData::Xid(xid) => {
                    save = true;
                    self.inner.handler.on_xid(&header, &pos).await?;
                    if let Some(gtid_set) = xid.gtid_set {
                        self.inner.master.update_gtid_set(gtid_set);
                    }
                }
                EventData::Gtid(gtid) => {
                    self.inner
                        .handler
                        .on_gtid(&header, GtidEventRef::MySql(&gtid))
                        .await?;
                }
                EventData::MariadbGtid(gtid) => {
                    self.inner
                        .handler
                        .on_gtid(&header, GtidEventRef::MariaDb(&gtid))
                        .await?;
                }
                EventData::RowsQuery(query) => {
                    self.inner.handler.on_rows_query(&header, &query).await?;
                }
                EventData::Query(query) => {
                    let changes = self.inner.ddl.parse(&query.query, &query.schema);
                    for change in &changes {
                        self.update_table(&header, &change.table.schema, &change.table.name)
                            .await?;
                    }
                    if !changes.is_empty() {
                        save = true;
                        force = true;
                        if let Err(e) = self.inner.handler.on_ddl(&header, &pos, &query).await {
                            if !self.inner.handler.is_ddl_error_recoverable(&e) {
                                return Err(e);
                            }
                            warn!("ignoring recoverable DDL handler error at {}: {}", pos, e);
                        }
                    }
                    if save {
                        if let Some(gtid_set) = query.gtid_set {
                            self.inner.master.update_gtid_set(gtid_set);
                        }
                    }
                }
                _ => continue,
            }

            if save {
                fake_rotate_log_name = None;
                self.save_position(Some(&header), pos, force).await?;
            }
        }
    }

    async fn handle_rows_event(&self, header: &EventHeader, rows: BinlogRowsEvent) -> Result<()> {
        let table = self.get_table(&rows.table.schema, &rows.table.table).await?;
        let event = RowsEvent::new(table, rows.action, rows.rows, Some(header.clone()))?;
        self.inner.handler.on_row(&event).await
    }

    /// A DDL statement changed `schema.table`: tell the handler, then drop
    /// the cached metadata.
    async fn update_table(&self, header: &EventHeader, schema: &str, table: &str) -> Result<()> {
        match self.inner.handler.on_table_changed(header, schema, table).await {
            Ok(()) | Err(CanalError::TableNotExist(_)) => {}
            Err(e) => return Err(e),
        }
        self.clear_table_cache(schema, table);
        info!("table structure changed, clear table cache: {}.{}", schema, table);
        Ok(())
    }

    async fn save_position(
        &self,
        header: Option<&EventHeader>,
        pos: Position,
        force: bool,
    ) -> Result<()> {
        let master = &self.inner.master;
        master.update(pos.clone());
        if let Some(header) = header {
            master.update_timestamp(header.timestamp);
        }
        master.persist(force).await?;
        let gtid_set = master.gtid_set();
        self.inner
            .handler
            .on_pos_synced(header, &pos, gtid_set.as_ref(), force)
            .await
    }

    fn update_replication_delay(&self, header: &EventHeader) {
        // Artificial events (fake rotate, heartbeats) carry no timestamp.
        if header.timestamp == 0 {
            return;
        }
        let delay = unix_now().saturating_sub(header.timestamp);
        self.inner.delay.store(delay, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Snapshot dump
    // ------------------------------------------------------------------

    async fn try_dump(&self) -> Result<()> {
        let master = &self.inner.master;
        if master.has_resume_point() {
            info!(
                "skip dump, use last binlog replication pos {} or GTID set {:?}",
                master.position(),
                master.gtid_set().map(|g| g.to_string())
            );
            return Ok(());
        }

        let config = &self.inner.config;
        if !config.dump.is_enabled() {
            info!("skip dump, no mysqldump configured");
            return Ok(());
        }
        let dumper = match Dumper::new(
            &config.dump,
            &config.addr,
            &config.user,
            &config.password,
            &config.charset,
        )
        .await
        {
            Ok(dumper) => dumper,
            Err(CanalError::DumpUtilityNotFound(path)) => {
                warn!("skip dump, mysqldump '{}' not found", path);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.run_dump(&dumper).await
    }

    async fn run_dump(&self, dumper: &Dumper) -> Result<()> {
        let master = &self.inner.master;
        let mut pos = Position::default();
        // An empty GTID set from `start_from_gtid` asks for the server's set
        // as of the dump.
        let mut gtid_set = match master.gtid_set() {
            Some(_) => Some(self.get_master_gtid_set().await?),
            None => None,
        };
        if self.inner.config.dump.skip_master_data {
            pos = self.get_master_pos().await?;
            info!("skip master data, get current binlog position {}", pos);
        }

        let started = Instant::now();
        info!("try dump MySQL and parse");
        let (mut items, producer) = dumper.spawn(self.inner.cancel.child_token())?;

        let consumed: Result<u64> = async {
            let mut rows = 0u64;
            while let Some(item) = items.recv().await {
                if self.inner.cancel.is_cancelled() {
                    return Err(CanalError::Cancelled);
                }
                match item {
                    DumpItem::BinlogPosition(p) => pos = p,
                    DumpItem::GtidSet(text) => match gtid_set.as_mut() {
                        Some(set) => set.update(&text)?,
                        None => gtid_set = Some(GtidSet::parse(self.inner.config.flavor, &text)?),
                    },
                    DumpItem::Row {
                        schema,
                        table,
                        values,
                    } => {
                        self.apply_dump_row(&schema, &table, &values).await?;
                        rows += 1;
                    }
                }
            }
            Ok(rows)
        }
        .await;

        let rows = match consumed {
            Ok(rows) => rows,
            Err(e) => {
                producer.abort();
                return Err(e);
            }
        };
        drop(items);
        producer
            .await
            .map_err(|e| CanalError::dump(format!("dump task failed: {}", e)))??;

        master.update(pos.clone());
        if let Some(set) = gtid_set.clone() {
            master.update_gtid_set(set);
        }
        master.persist(true).await?;
        self.inner
            .handler
            .on_pos_synced(None, &pos, master.gtid_set().as_ref(), true)
            .await?;

        info!(
            "dump MySQL and parse OK, {} rows in {:.2} seconds, start binlog replication at {}",
            rows,
            started.elapsed().as_secs_f64(),
            gtid_set.map(|g| g.to_string()).unwrap_or_else(|| pos.to_string())
        );
        Ok(())
    }

    /// Deliver one dumped row as an insert.
    async fn apply_dump_row(&self, schema: &str, table: &str, values: &[String]) -> Result<()> {
        let table = match self.get_table(schema, table).await {
            Ok(table) => table,
            Err(e) if e.is_skippable_table_error() => return Ok(()),
            Err(e) => {
                error!("get {}.{} information err: {}", schema, table, e);
                return Err(e);
            }
        };

        let row = values
            .iter()
            .enumerate()
            .map(|(i, value)| coerce_dump_value(&table, i, value))
            .collect::<Result<Vec<_>>>()?;
        let event = RowsEvent::new(table, RowsAction::Insert, vec![row], None)?;
        self.inner.handler.on_row(&event).await
    }

    /// Resolves once the snapshot dump finished or was skipped.
    pub async fn wait_dump_done(&self) -> Result<()> {
        let mut done = self.inner.dump_done.subscribe();
        tokio::select! {
            r = done.wait_for(|d| *d) => r
                .map(|_| ())
                .map_err(|_| CanalError::invariant("dump signal dropped")),
            _ = self.inner.cancel.cancelled() => Err(CanalError::Cancelled),
        }
    }

    // ------------------------------------------------------------------
    // Table metadata
    // ------------------------------------------------------------------

    /// Metadata of `schema.table`, fetched once and cached.
    pub async fn get_table(&self, schema: &str, table: &str) -> Result<Arc<Table>> {
        let key = format!("{}.{}", schema, table);
        if !self.inner.filter.check_table_match(&key) {
            return Err(CanalError::ExcludedTable);
        }
        if let Some(cached) = self.cached_table(&key) {
            return Ok(cached);
        }

        if self.inner.config.discard_no_meta_row_event {
            let failed_recently = self
                .inner
                .error_tables
                .lock()
                .ok()
                .and_then(|errors| errors.get(&key).copied())
                .is_some_and(|at| at.elapsed() < UNKNOWN_TABLE_RETRY_PERIOD);
            if failed_recently {
                return Err(CanalError::MissingTableMeta(key));
            }
        }

        match Table::fetch(self.inner.command.as_ref(), schema, table).await {
            Ok(fetched) => {
                let fetched = Arc::new(fetched);
                if let Ok(mut tables) = self.inner.tables.lock() {
                    tables.insert(key.clone(), fetched.clone());
                }
                if let Ok(mut errors) = self.inner.error_tables.lock() {
                    errors.remove(&key);
                }
                Ok(fetched)
            }
            Err(e @ CanalError::TableNotExist(_)) => Err(e),
            Err(_) if key == HA_HEALTH_CHECK_TABLE => {
                let mocked = Arc::new(Table::ha_health_check(schema, table));
                if let Ok(mut tables) = self.inner.tables.lock() {
                    tables.insert(key, mocked.clone());
                }
                Ok(mocked)
            }
            Err(e) if self.inner.config.discard_no_meta_row_event => {
                error!("canal get table meta err: {}", e);
                if let Ok(mut errors) = self.inner.error_tables.lock() {
                    errors.insert(key.clone(), Instant::now());
                }
                Err(CanalError::MissingTableMeta(key))
            }
            Err(e) => Err(e),
        }
    }

    fn cached_table(&self, key: &str) -> Option<Arc<Table>> {
        self.inner.tables.lock().ok()?.get(key).cloned()
    }

    /// Forget cached metadata of `schema.table`.
    pub fn clear_table_cache(&self, schema: &str, table: &str) {
        let key = format!("{}.{}", schema, table);
        if let Ok(mut tables) = self.inner.tables.lock() {
            tables.remove(&key);
        }
        if let Ok(mut errors) = self.inner.error_tables.lock() {
            errors.remove(&key);
        }
    }

    /// Install metadata for a table, e.g. one the server cannot describe.
    pub fn set_table_cache(&self, table: Table) {
        if let Ok(mut tables) = self.inner.tables.lock() {
            tables.insert(table.key(), Arc::new(table));
        }
    }

    pub fn check_table_match(&self, key: &str) -> bool {
        self.inner.filter.check_table_match(key)
    }

    // ------------------------------------------------------------------
    // Server status
    // ------------------------------------------------------------------

    /// Run a statement on the command connection.
    pub async fn execute(&self, sql: &str) -> Result<ResultSet> {
        self.inner.command.execute(sql).await
    }

    /// Current binlog coordinates of the server.
    pub async fn get_master_pos(&self) -> Result<Position> {
        // MySQL 8.4 removed SHOW MASTER STATUS; older servers lack the new name.
        let rs = match self.execute("SHOW BINARY LOG STATUS").await {
            Ok(rs) if !rs.is_empty() => rs,
            Ok(_) => self.execute("SHOW MASTER STATUS").await?,
            Err(e) => {
                debug!(error = %e, "SHOW BINARY LOG STATUS failed, trying SHOW MASTER STATUS");
                self.execute("SHOW MASTER STATUS").await?
            }
        };
        let name = rs
            .get(0, "File")
            .filter(|f| !f.is_empty())
            .ok_or_else(|| CanalError::query("server reports no binlog file; is binary logging enabled?"))?;
        let pos = rs
            .get(0, "Position")
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| CanalError::query(format!("invalid binlog position for {}", name)))?;
        Ok(Position::new(name, pos))
    }

    /// Executed GTID set of the server.
    pub async fn get_master_gtid_set(&self) -> Result<GtidSet> {
        let flavor = self.inner.config.flavor;
        let sql = match flavor {
            Flavor::MariaDb => "SELECT @@GLOBAL.gtid_current_pos",
            Flavor::MySql => "SELECT @@GLOBAL.GTID_EXECUTED",
        };
        let rs = self.execute(sql).await?;
        let text: String = rs
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.as_deref())
            .unwrap_or_default()
            .split_whitespace()
            .collect();
        GtidSet::parse(flavor, &text)
    }

    pub async fn flush_binlog(&self) -> Result<()> {
        self.execute("FLUSH BINARY LOGS").await.map(|_| ())
    }

    /// Wait until the canal has synced up to `pos`.
    ///
    /// Binlogs are flushed on every poll, so an idle server still produces
    /// a rotate the canal can observe.
    pub async fn wait_until_pos(&self, pos: &Position, timeout: Duration) -> Result<()> {
        let wait = async {
            loop {
                if !self.inner.config.disable_flush_binlog_while_waiting {
                    self.flush_binlog().await?;
                }
                let current = self.inner.master.position();
                if current.compare(pos).is_ge() {
                    return Ok(());
                }
                debug!("master pos is {}, wait catching {}", current, pos);
                tokio::select! {
                    _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
                    _ = self.inner.cancel.cancelled() => return Err(CanalError::Cancelled),
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(CanalError::timeout(format!(
                "wait position {} too long > {:?}",
                pos, timeout
            ))),
        }
    }

    /// Wait until the canal has caught up with the server's current position.
    pub async fn catch_master_pos(&self, timeout: Duration) -> Result<()> {
        let pos = self.get_master_pos().await?;
        self.wait_until_pos(&pos, timeout).await
    }

    /// Fail unless the server logs rows with `image` (`FULL`, `MINIMAL`, `NOBLOB`).
    ///
    /// MariaDB and servers without the variable always pass.
    pub async fn check_binlog_row_image(&self, image: &str) -> Result<()> {
        if self.inner.config.flavor != Flavor::MySql {
            return Ok(());
        }
        let rs = self
            .execute("SHOW GLOBAL VARIABLES LIKE 'binlog_row_image'")
            .await?;
        match rs.get(0, "Value") {
            Some(current) if !current.is_empty() && !current.eq_ignore_ascii_case(image) => {
                Err(CanalError::config(format!(
                    "MySQL uses {} binlog row image, but we want {}",
                    current, image
                )))
            }
            _ => Ok(()),
        }
    }

    async fn check_binlog_row_format(&self) -> Result<()> {
        let rs = self
            .execute("SHOW GLOBAL VARIABLES LIKE 'binlog_format'")
            .await?;
        match rs.get(0, "Value") {
            Some(format) if format.eq_ignore_ascii_case("ROW") => Ok(()),
            other => Err(CanalError::config(format!(
                "binlog must ROW format, but {} now",
                other.unwrap_or("<unset>")
            ))),
        }
    }

    /// Seconds between the last event's timestamp and its arrival.
    pub fn get_delay(&self) -> u32 {
        self.inner.delay.load(Ordering::Relaxed)
    }

    pub fn synced_position(&self) -> Position {
        self.inner.master.position()
    }

    pub fn synced_gtid_set(&self) -> Option<GtidSet> {
        self.inner.master.gtid_set()
    }

    pub fn synced_timestamp(&self) -> u32 {
        self.inner.master.timestamp()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop the canal and wait for the run loop to exit. Idempotent.
    ///
    /// Must not be called from inside a handler callback, which would wait
    /// on itself.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing canal");
        self.set_state(CanalState::Closing);
        self.inner.cancel.cancel();

        if let Some(mut syncer) = self.inner.syncer.lock().await.take() {
            syncer.close().await;
        }
        if let Err(e) = self.inner.command.close().await {
            warn!("failed to close command connection: {}", e);
        }

        // The run loop holds this lock until it returns.
        drop(self.inner.run_lock.lock().await);
        let task = self.inner.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            match task.await {
                Ok(Err(e)) => debug!("canal task ended with error: {}", e),
                Err(e) => warn!("canal task ended abnormally: {}", e),
                Ok(Ok(())) => {}
            }
        }

        let master = &self.inner.master;
        if let Err(e) = master.persist(true).await {
            warn!("failed to persist master info on close: {}", e);
        }
        let pos = master.position();
        let gtid_set = master.gtid_set();
        if let Err(e) = self
            .inner
            .handler
            .on_pos_synced(None, &pos, gtid_set.as_ref(), true)
            .await
        {
            warn!("final position sync failed: {}", e);
        }
        self.set_state(CanalState::Closed);
        info!("canal closed at {}", pos);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CdcSource for Canal {
    async fn start(&mut self) -> Result<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.is_closed() {
            return Err(CanalError::invariant("canal is closed"));
        }

        info!(
            "Starting canal for {} (server_id={})",
            self.inner.config.addr, self.inner.config.server_id
        );
        self.inner.running.store(true, Ordering::SeqCst);

        let canal = self.clone();
        let handle = tokio::spawn(async move {
            let result = canal.run().await;
            canal.inner.running.store(false, Ordering::SeqCst);
            result
        });
        if let Ok(mut task) = self.inner.task.lock() {
            *task = Some(handle);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        info!("Stopping canal");
        self.close().await;
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !self.is_closed()
    }
}

/// Where a reconnecting session resumes: the canal's own coordinates win
/// over the session's tracker once anything was synced.
fn resume_point(master: &MasterInfo) -> Option<StartPoint> {
    if let Some(gtid_set) = master.gtid_set().filter(|g| !g.is_empty()) {
        return Some(StartPoint::Gtid(gtid_set));
    }
    let pos = master.position();
    pos.is_set().then_some(StartPoint::Position(pos))
}

/// Convert one mysqldump literal to a row value typed by column `index`.
fn coerce_dump_value(table: &Table, index: usize, value: &str) -> Result<RowValue> {
    if value == "NULL" {
        return Ok(RowValue::Null);
    }
    if let Some(binary) = value.strip_prefix("_binary ") {
        let inner = binary
            .strip_prefix('\'')
            .and_then(|b| b.strip_suffix('\''))
            .unwrap_or(binary);
        return Ok(RowValue::Bytes(Bytes::from(unescape_string(inner).into_bytes())));
    }
    if value.starts_with('\'') {
        let inner = &value[1..value.len().saturating_sub(1).max(1)];
        return Ok(RowValue::String(inner.to_string()));
    }

    let column = table.columns.get(index).ok_or_else(|| {
        CanalError::invariant(format!(
            "dump row of {} has more values than the table's {} columns",
            table,
            table.columns.len()
        ))
    })?;
    let invalid = |expected: &str| {
        CanalError::dump(format!(
            "parse value {} of {}.{} error, {} expected",
            value, table, column.name, expected
        ))
    };

    match column.kind {
        ColumnKind::Number | ColumnKind::MediumInt => {
            if column.is_unsigned {
                value.parse::<u64>().map(RowValue::UInt64).map_err(|_| invalid("int"))
            } else {
                value.parse::<i64>().map(RowValue::Int64).map_err(|_| invalid("int"))
            }
        }
        ColumnKind::Float => value
            .parse::<f64>()
            .map(RowValue::Double)
            .map_err(|_| invalid("float")),
        ColumnKind::Decimal => Ok(RowValue::Decimal(value.to_string())),
        // --hex-blob dumps BIT columns as 0x.. too
        ColumnKind::Bit => {
            let parsed = if let Some(hex) = value.strip_prefix("0x") {
                u64::from_str_radix(hex, 16)
            } else if let Some(bits) = value.strip_prefix("b'").and_then(|b| b.strip_suffix('\'')) {
                u64::from_str_radix(bits, 2)
            } else {
                return Err(invalid("bit"));
            };
            parsed.map(RowValue::Bit).map_err(|_| invalid("bit"))
        }
        _ if value.starts_with("0x") => hex::decode(&value[2..])
            .map(|b| RowValue::Bytes(Bytes::from(b)))
            .map_err(|_| invalid("hex")),
        _ => Err(invalid("quoted value")),
    }
}

fn unix_now() -> u32 {
    u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
