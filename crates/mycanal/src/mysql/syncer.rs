//! Replication session
//!
//! [`BinlogSyncer`] registers as a replica, requests a binlog dump and spawns a
//! task that reads, decodes and forwards events into a bounded channel drained
//! through [`BinlogStreamer`]. The task survives broken connections: it
//! reconnects with exponential backoff and resumes from the coordinates
//! supplied by a [`ResumeCallback`] (or its own tracked position).
//!
//! ```text
//! Disconnected → Registered → Streaming → Closed
//!                                  ↓
//!                               Faulted → (reconnect) → Registered
//! ```

use crate::common::{
    CanalError, ExponentialBackoff, ReadTimeoutBackoff, ReconnectPolicy, Result,
};
use crate::mysql::decoder::BinlogParser;
use crate::mysql::event::{BinlogEvent, EventData};
use crate::mysql::gtid::{Flavor, GtidSet, MariadbGtid};
use crate::mysql::position::{Position, BINLOG_START_POSITION};
use crate::mysql::protocol::{
    connect_tcp, ReplicationConn, EOF_HEADER, ERR_HEADER, OK_HEADER, SEMI_SYNC_INDICATOR,
};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Byte stream the session runs over.
pub trait ReplicationStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ReplicationStream for T {}

pub type BoxedStream = Box<dyn ReplicationStream>;

/// Opens a fresh byte stream to the source server.
pub type Connector = Arc<dyn Fn() -> BoxFuture<'static, Result<BoxedStream>> + Send + Sync>;

/// Where a (re)started dump begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPoint {
    Position(Position),
    Gtid(GtidSet),
}

/// Supplies the durable resume point on reconnect; `None` falls back to the
/// session's own tracked coordinates.
pub type ResumeCallback = Arc<dyn Fn() -> Option<StartPoint> + Send + Sync>;

/// Replication session settings.
#[derive(Clone)]
pub struct SyncerConfig {
    /// Server id announced to the source; must be unique among replicas
    pub server_id: u32,
    pub flavor: Flavor,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Host name reported in COM_REGISTER_SLAVE
    pub localhost: String,
    pub charset: String,
    /// Source heartbeat period; zero leaves the server default
    pub heartbeat_period: Duration,
    /// Baseline read timeout
    pub read_timeout: Duration,
    /// Read timeout cap; a silent stream past this is considered dead
    pub max_read_timeout: Duration,
    pub connect_timeout: Duration,
    /// Zero or negative means unlimited
    pub max_reconnect_attempts: i32,
    pub disable_retry_sync: bool,
    pub semi_sync_enabled: bool,
    pub verify_checksum: bool,
    pub event_channel_capacity: usize,
    pub reconnect_backoff_base: Duration,
    pub reconnect_backoff_max: Duration,
}

impl std::fmt::Debug for SyncerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncerConfig")
            .field("server_id", &self.server_id)
            .field("flavor", &self.flavor)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("heartbeat_period", &self.heartbeat_period)
            .field("read_timeout", &self.read_timeout)
            .field("max_read_timeout", &self.max_read_timeout)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("disable_retry_sync", &self.disable_retry_sync)
            .field("semi_sync_enabled", &self.semi_sync_enabled)
            .finish_non_exhaustive()
    }
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            server_id: 1001,
            flavor: Flavor::MySql,
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            localhost: String::new(),
            charset: "utf8mb4".to_string(),
            heartbeat_period: Duration::from_secs(30),
            read_timeout: Duration::from_secs(90),
            max_read_timeout: Duration::from_secs(15 * 60),
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 0,
            disable_retry_sync: false,
            semi_sync_enabled: false,
            verify_checksum: true,
            event_channel_capacity: 10_240,
            reconnect_backoff_base: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(30),
        }
    }
}

impl SyncerConfig {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            ..Default::default()
        }
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

    pub fn with_read_timeout(mut self, baseline: Duration, cap: Duration) -> Self {
        self.read_timeout = baseline;
        self.max_read_timeout = cap;
        self
    }

    pub fn with_semi_sync(mut self, enabled: bool) -> Self {
        self.semi_sync_enabled = enabled;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_id == 0 {
            return Err(CanalError::config("server_id must be non-zero"));
        }
        if self.host.is_empty() {
            return Err(CanalError::config("host must not be empty"));
        }
        if self.read_timeout.is_zero() {
            return Err(CanalError::config("read_timeout must be positive"));
        }
        if self.event_channel_capacity == 0 {
            return Err(CanalError::config("event_channel_capacity must be positive"));
        }
        Ok(())
    }

    fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.max_reconnect_attempts, self.disable_retry_sync)
    }
}

/// Consumer side of a replication session.
pub struct BinlogStreamer {
    rx: mpsc::Receiver<Result<BinlogEvent>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for BinlogStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinlogStreamer")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl BinlogStreamer {
    /// Stand-alone streamer fed through the returned sender.
    ///
    /// Lets integrators replay events from a file or a test fixture through
    /// the same consumer path as a live session.
    pub fn channel(
        capacity: usize,
        cancel: CancellationToken,
    ) -> (mpsc::Sender<Result<BinlogEvent>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx, cancel })
    }

    /// Next event; `Cancelled` once the session is closed.
    pub async fn get_event(&mut self) -> Result<BinlogEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CanalError::Cancelled),
            item = self.rx.recv() => match item {
                Some(result) => result,
                None => Err(CanalError::connection_broken("binlog stream closed")),
            },
        }
    }

    /// Next event or `None` when nothing arrives within `timeout`.
    pub async fn get_event_timeout(&mut self, timeout: Duration) -> Result<Option<BinlogEvent>> {
        match tokio::time::timeout(timeout, self.get_event()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}

/// Fake-replica client.
pub struct BinlogSyncer {
    config: SyncerConfig,
    connector: Connector,
    cancel: CancellationToken,
    resume: Option<ResumeCallback>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for BinlogSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinlogSyncer")
            .field("config", &self.config)
            .field("running", &self.task.is_some())
            .field("closed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl BinlogSyncer {
    /// Syncer connecting over TCP to `config.host:config.port`.
    pub fn new(config: SyncerConfig) -> Self {
        let addr = config.address();
        let connect_timeout = config.connect_timeout;
        let connector: Connector = Arc::new(move || {
            let addr = addr.clone();
            async move {
                let stream = connect_tcp(&addr, connect_timeout).await?;
                Ok::<BoxedStream, CanalError>(Box::new(stream))
            }
            .boxed()
        });
        Self::with_connector(config, connector)
    }

    /// Syncer over a custom transport.
    pub fn with_connector(config: SyncerConfig, connector: Connector) -> Self {
        Self {
            config,
            connector,
            cancel: CancellationToken::new(),
            resume: None,
            task: None,
        }
    }

    /// Tie the session lifetime to a parent token.
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn set_resume_callback(&mut self, callback: ResumeCallback) {
        self.resume = Some(callback);
    }

    pub fn config(&self) -> &SyncerConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stream from a file/position pair.
    pub async fn start_sync(&mut self, mut pos: Position) -> Result<BinlogStreamer> {
        if !pos.name.is_empty() && pos.pos < BINLOG_START_POSITION {
            pos.pos = BINLOG_START_POSITION;
        }
        info!(position = %pos, "begin to sync binlog from position");
        self.start(StartPoint::Position(pos)).await
    }

    /// Stream from a GTID set.
    pub async fn start_sync_gtid(&mut self, gtid_set: GtidSet) -> Result<BinlogStreamer> {
        if gtid_set.flavor() != self.config.flavor {
            return Err(CanalError::config(format!(
                "GTID set flavor {} does not match configured flavor {}",
                gtid_set.flavor(),
                self.config.flavor
            )));
        }
        info!(gtid_set = %gtid_set, "begin to sync binlog from GTID set");
        self.start(StartPoint::Gtid(gtid_set)).await
    }

    async fn start(&mut self, start: StartPoint) -> Result<BinlogStreamer> {
        if self.cancel.is_cancelled() {
            return Err(CanalError::Cancelled);
        }
        if self.task.is_some() {
            return Err(CanalError::invariant("binlog sync is already running"));
        }
        self.config.validate()?;

        let session = tokio::select! {
            _ = self.cancel.cancelled() => return Err(CanalError::Cancelled),
            session = Session::open(&self.config, &self.connector, &start) => session?,
        };

        let (tx, streamer) =
            BinlogStreamer::channel(self.config.event_channel_capacity, self.cancel.clone());
        let runner = SessionRunner {
            config: self.config.clone(),
            connector: self.connector.clone(),
            resume: self.resume.clone(),
            cancel: self.cancel.clone(),
            tracker: Tracker::new(start),
            tx,
        };
        self.task = Some(tokio::spawn(runner.run(session)));
        Ok(streamer)
    }

    /// Stop streaming; idempotent.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "binlog sync task ended abnormally");
            }
            info!("binlog syncer closed");
        }
    }
}

impl Drop for BinlogSyncer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One registered and dumping connection.
struct Session {
    conn: ReplicationConn<BoxedStream>,
    parser: BinlogParser,
    semi_sync: bool,
}

impl Session {
    async fn open(config: &SyncerConfig, connector: &Connector, start: &StartPoint) -> Result<Self> {
        let stream = connector().await?;
        let mut conn =
            ReplicationConn::handshake(stream, &config.user, &config.password, None, &config.charset)
                .await?;

        let crc32 = prepare_session(&mut conn, config).await?;
        let semi_sync = if config.semi_sync_enabled {
            enable_semi_sync(&mut conn).await?
        } else {
            false
        };

        conn.register_slave(
            config.server_id,
            &config.localhost,
            &config.user,
            &config.password,
            config.port,
        )
        .await?;

        match start {
            StartPoint::Position(pos) => conn.binlog_dump(config.server_id, pos, 0).await?,
            StartPoint::Gtid(GtidSet::MySql(set)) => {
                conn.binlog_dump_gtid(config.server_id, set).await?
            }
            StartPoint::Gtid(GtidSet::MariaDb(set)) => {
                conn.execute(&format!("SET @slave_connect_state='{}'", set))
                    .await?;
                conn.execute("SET @slave_gtid_strict_mode=1").await?;
                conn.execute("SET @slave_gtid_ignore_duplicates=0").await?;
                conn.binlog_dump(config.server_id, &Position::new("", 0), 0)
                    .await?
            }
        }

        Ok(Self {
            conn,
            parser: BinlogParser::new()
                .with_verify_checksum(config.verify_checksum)
                .with_checksum_before_format(crc32),
            semi_sync,
        })
    }
}

/// Session variables a checksum-aware replica sets before dumping.
///
/// Returns whether the dump will carry CRC32 trailers from its first event.
async fn prepare_session(conn: &mut ReplicationConn<BoxedStream>, config: &SyncerConfig) -> Result<bool> {
    let checksum = conn
        .query("SHOW GLOBAL VARIABLES LIKE 'BINLOG_CHECKSUM'")
        .await?;
    let server_checksum = checksum.get(0, "Value").unwrap_or_default().to_string();
    if !server_checksum.is_empty() {
        if let Err(e) = conn
            .execute("SET @source_binlog_checksum = @@global.binlog_checksum")
            .await
        {
            debug!(error = %e, "falling back to @master_binlog_checksum");
            conn.execute("SET @master_binlog_checksum = @@global.binlog_checksum")
                .await?;
        }
    }

    if config.flavor == Flavor::MariaDb {
        // MARIA_SLAVE_CAPABILITY_GTID
        conn.execute("SET @mariadb_slave_capability=4").await?;
    }

    if !config.heartbeat_period.is_zero() {
        let nanos = config.heartbeat_period.as_nanos();
        conn.execute(&format!("SET @master_heartbeat_period={}", nanos))
            .await?;
    }

    if config.flavor == Flavor::MySql {
        let replica_uuid = Uuid::new_v4();
        if let Err(e) = conn
            .execute(&format!(
                "SET @slave_uuid = '{0}', @replica_uuid = '{0}'",
                replica_uuid
            ))
            .await
        {
            debug!(error = %e, "replica uuid not accepted");
        }
    }
    Ok(server_checksum.eq_ignore_ascii_case("CRC32"))
}

async fn enable_semi_sync(conn: &mut ReplicationConn<BoxedStream>) -> Result<bool> {
    let rs = conn
        .query("SHOW VARIABLES LIKE 'rpl_semi_sync_master_enabled'")
        .await?;
    match rs.get(0, "Value") {
        Some(v) if v.eq_ignore_ascii_case("ON") => {
            conn.execute("SET @rpl_semi_sync_slave = 1").await?;
            info!("semi-sync replication enabled");
            Ok(true)
        }
        _ => {
            warn!("source does not have semi-sync enabled, continuing without acks");
            Ok(false)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingGtid {
    MySql(Uuid, i64),
    MariaDb(MariadbGtid),
}

/// Coordinates of the last event handed to the consumer.
#[derive(Debug)]
struct Tracker {
    position: Position,
    gtid_set: Option<GtidSet>,
    pending: Option<PendingGtid>,
}

impl Tracker {
    fn new(start: StartPoint) -> Self {
        match start {
            StartPoint::Position(position) => Self {
                position,
                gtid_set: None,
                pending: None,
            },
            StartPoint::Gtid(set) => Self {
                position: Position::default(),
                gtid_set: Some(set),
                pending: None,
            },
        }
    }

    fn resume_point(&self) -> StartPoint {
        match &self.gtid_set {
            Some(set) => StartPoint::Gtid(set.clone()),
            None => StartPoint::Position(self.position.clone()),
        }
    }

    fn commit_pending(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        match (&mut self.gtid_set, pending) {
            (Some(GtidSet::MySql(set)), PendingGtid::MySql(sid, gno)) => set.add_gtid(sid, gno),
            (Some(GtidSet::MariaDb(set)), PendingGtid::MariaDb(gtid)) => set.add_gtid(gtid),
            _ => {}
        }
    }

    /// Advance coordinates and fill in GTID sets on commit events.
    fn observe(&mut self, event: &mut BinlogEvent) {
        if event.header.log_pos > 0 {
            self.position.pos = event.header.log_pos;
        }

        match &mut event.event {
            EventData::Rotate(rotate) => {
                self.position = Position::new(rotate.next_log_name.clone(), rotate.position as u32);
                debug!(position = %self.position, "rotate to next binlog");
            }
            EventData::Gtid(gtid) if !gtid.anonymous => {
                self.pending = Some(PendingGtid::MySql(gtid.sid, gtid.gno));
            }
            EventData::MariadbGtid(gtid) => {
                self.pending = Some(PendingGtid::MariaDb(gtid.gtid));
            }
            EventData::Xid(xid) => {
                self.commit_pending();
                xid.gtid_set = self.gtid_set.clone();
            }
            EventData::Query(query) => {
                if !query.query.trim().eq_ignore_ascii_case("BEGIN") {
                    self.commit_pending();
                }
                query.gtid_set = self.gtid_set.clone();
            }
            _ => {}
        }
    }
}

/// Outcome of reading one session until it stops.
enum SessionEnd {
    Cancelled,
    ConsumerGone,
    Failed(CanalError),
}

struct SessionRunner {
    config: SyncerConfig,
    connector: Connector,
    resume: Option<ResumeCallback>,
    cancel: CancellationToken,
    tracker: Tracker,
    tx: mpsc::Sender<Result<BinlogEvent>>,
}

impl SessionRunner {
    async fn run(mut self, first: Session) {
        let policy = self.config.reconnect_policy();
        let mut backoff = ExponentialBackoff::new(
            self.config.reconnect_backoff_base,
            self.config.reconnect_backoff_max,
        );
        let mut session = first;

        loop {
            let err = match self.stream(&mut session).await {
                SessionEnd::Cancelled | SessionEnd::ConsumerGone => {
                    session.conn.close().await;
                    return;
                }
                SessionEnd::Failed(err) => err,
            };
            session.conn.close().await;

            if !err.is_retriable() || !policy.should_retry(1) {
                error!(error = %err, "binlog sync failed");
                let _ = self.tx.send(Err(err)).await;
                return;
            }
            warn!(error = %err, "binlog connection lost, reconnecting");

            match self.reconnect(&policy, &mut backoff, err).await {
                Ok(Some(next)) => {
                    backoff.reset();
                    session = next;
                }
                Ok(None) => return,
                Err(fatal) => {
                    error!(error = %fatal, "giving up on binlog sync");
                    let _ = self.tx.send(Err(fatal)).await;
                    return;
                }
            }
        }
    }

    /// Retry until a session opens, attempts run out, or the syncer closes.
    async fn reconnect(
        &mut self,
        policy: &ReconnectPolicy,
        backoff: &mut ExponentialBackoff,
        mut last_error: CanalError,
    ) -> Result<Option<Session>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if !policy.should_retry(attempt) {
                return Err(CanalError::connection_broken(format!(
                    "reconnect failed after {} attempts: {}",
                    attempt - 1,
                    last_error
                )));
            }

            let delay = backoff.next_backoff();
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }

            let start = self
                .resume
                .as_ref()
                .and_then(|cb| cb())
                .unwrap_or_else(|| self.tracker.resume_point());
            info!(attempt, start = ?start, "reconnecting binlog sync");

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                opened = Session::open(&self.config, &self.connector, &start) => opened,
            };
            match opened {
                Ok(session) => {
                    self.tracker = Tracker::new(start);
                    info!(attempt, "binlog sync resumed");
                    return Ok(Some(session));
                }
                Err(e) if e.is_retriable() => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read packets from one session until it ends.
    async fn stream(&mut self, session: &mut Session) -> SessionEnd {
        let mut read_timeout =
            ReadTimeoutBackoff::new(self.config.read_timeout, self.config.max_read_timeout);

        loop {
            let timeout = read_timeout.current();
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                // read_packet keeps partial frames across cancellation
                read = tokio::time::timeout(timeout, session.conn.read_packet()) => read,
            };

            let packet = match read {
                Err(_) => match read_timeout.on_timeout() {
                    Some(next) => {
                        debug!(?timeout, ?next, "no binlog data, extending read timeout");
                        continue;
                    }
                    None => {
                        return SessionEnd::Failed(CanalError::timeout(format!(
                            "no binlog data within {:?}",
                            self.config.max_read_timeout
                        )))
                    }
                },
                Ok(Err(e)) => return SessionEnd::Failed(e),
                Ok(Ok(packet)) => packet,
            };
            read_timeout.reset();

            match packet.first().copied() {
                Some(OK_HEADER) => {}
                Some(ERR_HEADER) => {
                    return SessionEnd::Failed(crate::mysql::protocol::parse_err_packet(&packet))
                }
                Some(EOF_HEADER) => {
                    debug!("received EOF packet, no more binlog events for now");
                    continue;
                }
                other => {
                    return SessionEnd::Failed(CanalError::protocol(format!(
                        "unexpected binlog packet header {:?}",
                        other
                    )))
                }
            }

            let (body, need_ack) = match split_event_packet(&packet, session.semi_sync) {
                Ok(split) => split,
                Err(e) => return SessionEnd::Failed(e),
            };

            let mut event = match session.parser.parse_event(body) {
                Ok(event) => event,
                Err(e) => return SessionEnd::Failed(e),
            };
            trace!(event_type = %event.event_type(), log_pos = event.header.log_pos, "binlog event");

            self.tracker.observe(&mut event);
            if matches!(event.event, EventData::Heartbeat(_)) {
                continue;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                sent = self.tx.send(Ok(event)) => {
                    if sent.is_err() {
                        debug!("binlog consumer dropped");
                        return SessionEnd::ConsumerGone;
                    }
                }
            }

            if need_ack {
                if let Err(e) = session.conn.send_semi_sync_ack(&self.tracker.position).await {
                    return SessionEnd::Failed(e);
                }
            }
        }
    }
}

/// Strip the OK byte and, in semi-sync mode, the two byte semi-sync header.
fn split_event_packet(packet: &Bytes, semi_sync: bool) -> Result<(Bytes, bool)> {
    if semi_sync && packet.get(1) == Some(&SEMI_SYNC_INDICATOR) {
        if packet.len() < 3 {
            return Err(CanalError::protocol("truncated semi-sync packet"));
        }
        return Ok((packet.slice(3..), packet[2] == 0x01));
    }
    Ok((packet.slice(1..), false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql::codec::{put_lenenc_bytes, ByteReader};
    use crate::mysql::encoder::EventEncoder;
    use crate::mysql::gtid::MysqlGtidSet;
    use crate::mysql::packet::PacketConn;
    use crate::mysql::protocol::{COM_BINLOG_DUMP, COM_BINLOG_DUMP_GTID, COM_QUERY, COM_REGISTER_SLAVE};
    use bytes::{BufMut, BytesMut};
    use std::sync::Mutex;
    use tokio::io::{duplex, DuplexStream};

    const SID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    /// What a scripted server session does once the dump command arrives.
    #[derive(Clone)]
    enum Script {
        /// Send these events then keep the connection idle
        Events(Vec<Bytes>),
        /// Send these events then drop the connection
        EventsThenDrop(Vec<Bytes>),
        /// Reply with an ERR packet
        Error(u16, &'static str),
        /// Send semi-sync flagged events and collect acks
        SemiSync(Vec<Bytes>),
    }

    #[derive(Default)]
    struct Recorded {
        dumps: Vec<Vec<u8>>,
        queries: Vec<String>,
        acks: Vec<Vec<u8>>,
    }

    fn greeting() -> Vec<u8> {
        let caps: u32 = 0x0000_0200 | 0x0000_8000 | 0x0008_0000 | 0x0100_0000;
        let mut p = BytesMut::new();
        p.put_u8(10);
        p.put_slice(b"8.0.36\0");
        p.put_u32_le(7);
        p.put_slice(b"abcdefgh");
        p.put_u8(0);
        p.put_u16_le(caps as u16);
        p.put_u8(45);
        p.put_u16_le(2);
        p.put_u16_le((caps >> 16) as u16);
        p.put_u8(21);
        p.put_slice(&[0u8; 10]);
        p.put_slice(b"ijklmnopqrst\0");
        p.put_slice(b"mysql_native_password\0");
        p.to_vec()
    }

    const OK: &[u8] = &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];

    async fn write_result_set(server: &mut PacketConn<DuplexStream>, value: Option<&str>) {
        server.write_packet(&[2]).await.unwrap();
        for name in ["Variable_name", "Value"] {
            let mut def = BytesMut::new();
            for part in ["def", "", "", "", name, name] {
                put_lenenc_bytes(&mut def, part.as_bytes());
            }
            def.put_u8(0x0c);
            def.put_slice(&[0u8; 12]);
            server.write_packet(&def).await.unwrap();
        }
        if let Some(value) = value {
            let mut row = BytesMut::new();
            put_lenenc_bytes(&mut row, b"x");
            put_lenenc_bytes(&mut row, value.as_bytes());
            server.write_packet(&row).await.unwrap();
        }
        server.write_packet(&[0xFE, 0, 0, 2, 0, 0, 0]).await.unwrap();
    }

    async fn serve(stream: DuplexStream, script: Script, recorded: Arc<Mutex<Recorded>>) {
        let mut server = PacketConn::new(stream);
        server.write_packet(&greeting()).await.unwrap();
        server.read_packet().await.unwrap();
        server.write_packet(OK).await.unwrap();

        loop {
            server.reset_sequence();
            let Ok(cmd) = server.read_packet().await else {
                return;
            };
            match cmd[0] {
                COM_QUERY => {
                    let sql = String::from_utf8_lossy(&cmd[1..]).into_owned();
                    recorded.lock().unwrap().queries.push(sql.clone());
                    if sql.contains("BINLOG_CHECKSUM") {
                        write_result_set(&mut server, Some("CRC32")).await;
                    } else if sql.contains("rpl_semi_sync_master_enabled") {
                        write_result_set(&mut server, Some("ON")).await;
                    } else {
                        server.write_packet(OK).await.unwrap();
                    }
                }
                COM_REGISTER_SLAVE => server.write_packet(OK).await.unwrap(),
                COM_BINLOG_DUMP | COM_BINLOG_DUMP_GTID => {
                    recorded.lock().unwrap().dumps.push(cmd.to_vec());
                    break;
                }
                _ => return,
            }
        }

        match script {
            Script::Events(events) => {
                send_events(&mut server, &events).await;
                // idle until the client goes away
                let _ = server.read_packet().await;
            }
            Script::EventsThenDrop(events) => send_events(&mut server, &events).await,
            Script::Error(code, msg) => {
                let mut p = BytesMut::new();
                p.put_u8(0xFF);
                p.put_u16_le(code);
                p.put_slice(b"#HY000");
                p.put_slice(msg.as_bytes());
                server.write_packet(&p).await.unwrap();
            }
            Script::SemiSync(events) => {
                for ev in &events {
                    let mut p = BytesMut::new();
                    p.put_slice(&[0x00, SEMI_SYNC_INDICATOR, 0x01]);
                    p.put_slice(ev);
                    server.write_packet(&p).await.unwrap();
                    server.reset_sequence();
                    let ack = server.read_packet().await.unwrap();
                    recorded.lock().unwrap().acks.push(ack.to_vec());
                }
                let _ = server.read_packet().await;
            }
        }
    }

    async fn send_events(server: &mut PacketConn<DuplexStream>, events: &[Bytes]) {
        for ev in events {
            let mut p = BytesMut::new();
            p.put_u8(0x00);
            p.put_slice(ev);
            server.write_packet(&p).await.unwrap();
        }
    }

    /// Connector that hands each new connection the next script.
    fn scripted(scripts: Vec<Script>) -> (Connector, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let scripts = Arc::new(Mutex::new(scripts.into_iter()));
        let rec = recorded.clone();
        let connector: Connector = Arc::new(move || {
            let next = scripts.lock().unwrap().next();
            let rec = rec.clone();
            async move {
                let script = next.ok_or_else(|| CanalError::connection_broken("refused"))?;
                let (client, server) = duplex(1 << 20);
                tokio::spawn(serve(server, script, rec));
                Ok::<BoxedStream, CanalError>(Box::new(client))
            }
            .boxed()
        });
        (connector, recorded)
    }

    fn test_config() -> SyncerConfig {
        SyncerConfig {
            read_timeout: Duration::from_millis(200),
            max_read_timeout: Duration::from_millis(400),
            heartbeat_period: Duration::ZERO,
            reconnect_backoff_base: Duration::from_millis(5),
            reconnect_backoff_max: Duration::from_millis(20),
            max_reconnect_attempts: 3,
            event_channel_capacity: 16,
            ..SyncerConfig::new("127.0.0.1", 3306, "repl")
        }
    }

    fn with_pos(raw: Bytes, log_pos: u32) -> Bytes {
        let mut buf = raw.to_vec();
        crate::mysql::encoder::set_log_pos(&mut buf, log_pos, true);
        Bytes::from(buf)
    }

    fn session_events(enc: &EventEncoder) -> Vec<Bytes> {
        vec![
            enc.rotate("mysql-bin.000002", 4),
            enc.format_description("8.0.36"),
            enc.heartbeat("mysql-bin.000002"),
            with_pos(enc.query("test", "BEGIN"), 300),
            with_pos(enc.xid(99), 400),
        ]
    }

    #[tokio::test]
    async fn test_position_sync_streams_events() {
        let enc = EventEncoder::new(1);
        let (connector, recorded) = scripted(vec![Script::Events(session_events(&enc))]);
        let mut syncer = BinlogSyncer::with_connector(test_config(), connector);

        let mut streamer = syncer
            .start_sync(Position::new("mysql-bin.000002", 4))
            .await
            .unwrap();

        let ev = streamer.get_event().await.unwrap();
        assert!(matches!(ev.event, EventData::Rotate(_)));
        let ev = streamer.get_event().await.unwrap();
        assert!(matches!(ev.event, EventData::FormatDescription(_)));
        // heartbeat is swallowed
        let ev = streamer.get_event().await.unwrap();
        assert!(matches!(ev.event, EventData::Query(_)));
        let ev = streamer.get_event().await.unwrap();
        match ev.event {
            EventData::Xid(xid) => {
                assert_eq!(xid.xid, 99);
                assert!(xid.gtid_set.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        syncer.close().await;

        let recorded = recorded.lock().unwrap();
        assert!(recorded
            .queries
            .iter()
            .any(|q| q.contains("@source_binlog_checksum")));
        let dump = &recorded.dumps[0];
        let mut r = ByteReader::new(dump);
        assert_eq!(r.u8().unwrap(), COM_BINLOG_DUMP);
        assert_eq!(r.u32_le().unwrap(), 4);
        r.skip(6).unwrap();
        assert_eq!(r.rest(), b"mysql-bin.000002");
    }

    #[tokio::test]
    async fn test_gtid_sync_merges_committed_gtid() {
        let enc = EventEncoder::new(1);
        let sid = Uuid::parse_str(SID).unwrap();
        let events = vec![
            enc.format_description("8.0.36"),
            with_pos(enc.gtid(sid, 6, 5, 6), 200),
            with_pos(enc.query("test", "BEGIN"), 300),
            with_pos(enc.xid(7), 400),
        ];
        let (connector, recorded) = scripted(vec![Script::Events(events)]);
        let mut syncer = BinlogSyncer::with_connector(test_config(), connector);

        let start = GtidSet::parse(Flavor::MySql, &format!("{}:1-5", SID)).unwrap();
        let mut streamer = syncer.start_sync_gtid(start).await.unwrap();

        let mut last = None;
        for _ in 0..4 {
            last = Some(streamer.get_event().await.unwrap());
        }
        match last.unwrap().event {
            EventData::Xid(xid) => {
                assert_eq!(
                    xid.gtid_set.unwrap().to_string(),
                    format!("{}:1-6", SID)
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        syncer.close().await;

        let dump = recorded.lock().unwrap().dumps[0].clone();
        assert_eq!(dump[0], COM_BINLOG_DUMP_GTID);
        let set = MysqlGtidSet::decode(&dump[23..]).unwrap();
        assert_eq!(set.to_string(), format!("{}:1-5", SID));
    }

    #[tokio::test]
    async fn test_flavor_mismatch_rejected() {
        let (connector, _) = scripted(vec![]);
        let mut syncer = BinlogSyncer::with_connector(test_config(), connector);
        let set = GtidSet::parse(Flavor::MariaDb, "0-1-100").unwrap();
        let err = syncer.start_sync_gtid(set).await.unwrap_err();
        assert!(matches!(err, CanalError::Config(_)));
    }

    #[tokio::test]
    async fn test_reconnect_resumes_from_callback() {
        let enc = EventEncoder::new(1);
        let first = vec![
            enc.rotate("mysql-bin.000002", 4),
            enc.format_description("8.0.36"),
        ];
        let second = vec![
            enc.rotate("mysql-bin.000003", 4),
            enc.format_description("8.0.36"),
        ];
        let (connector, recorded) = scripted(vec![
            Script::EventsThenDrop(first),
            Script::Events(second),
        ]);
        let mut syncer = BinlogSyncer::with_connector(test_config(), connector);
        syncer.set_resume_callback(Arc::new(|| {
            Some(StartPoint::Position(Position::new("mysql-bin.000003", 4)))
        }));

        let mut streamer = syncer
            .start_sync(Position::new("mysql-bin.000002", 4))
            .await
            .unwrap();

        let mut rotates = Vec::new();
        while rotates.len() < 2 {
            if let EventData::Rotate(r) = streamer.get_event().await.unwrap().event {
                rotates.push(r.next_log_name);
            }
        }
        assert_eq!(rotates, vec!["mysql-bin.000002", "mysql-bin.000003"]);
        syncer.close().await;

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.dumps.len(), 2);
        assert!(recorded.dumps[1].ends_with(b"mysql-bin.000003"));
    }

    #[tokio::test]
    async fn test_idle_stream_reconnects_after_read_timeout() {
        let enc = EventEncoder::new(1);
        let (connector, recorded) = scripted(vec![
            Script::Events(vec![]),
            Script::Events(vec![enc.rotate("mysql-bin.000009", 4)]),
        ]);
        let config = SyncerConfig {
            read_timeout: Duration::from_millis(20),
            max_read_timeout: Duration::from_millis(40),
            ..test_config()
        };
        let mut syncer = BinlogSyncer::with_connector(config, connector);
        let mut streamer = syncer
            .start_sync(Position::new("mysql-bin.000009", 4))
            .await
            .unwrap();

        let ev = streamer.get_event().await.unwrap();
        assert!(matches!(ev.event, EventData::Rotate(_)));
        assert_eq!(recorded.lock().unwrap().dumps.len(), 2);
        syncer.close().await;
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_surfaces_error() {
        let (connector, _) = scripted(vec![Script::EventsThenDrop(vec![])]);
        let config = SyncerConfig {
            max_reconnect_attempts: 2,
            ..test_config()
        };
        let mut syncer = BinlogSyncer::with_connector(config, connector);
        let mut streamer = syncer
            .start_sync(Position::new("mysql-bin.000001", 4))
            .await
            .unwrap();

        let err = streamer.get_event().await.unwrap_err();
        assert!(err.to_string().contains("after 2 attempts"), "{}", err);
        syncer.close().await;
    }

    #[tokio::test]
    async fn test_disable_retry_surfaces_first_error() {
        let (connector, _) = scripted(vec![Script::EventsThenDrop(vec![])]);
        let config = SyncerConfig {
            disable_retry_sync: true,
            ..test_config()
        };
        let mut syncer = BinlogSyncer::with_connector(config, connector);
        let mut streamer = syncer
            .start_sync(Position::new("mysql-bin.000001", 4))
            .await
            .unwrap();

        let err = streamer.get_event().await.unwrap_err();
        assert!(matches!(err, CanalError::ConnectionBroken(_)));
        syncer.close().await;
    }

    #[tokio::test]
    async fn test_server_error_is_fatal() {
        let (connector, _) = scripted(vec![Script::Error(1045, "Access denied")]);
        let mut syncer = BinlogSyncer::with_connector(test_config(), connector);
        let mut streamer = syncer
            .start_sync(Position::new("mysql-bin.000001", 4))
            .await
            .unwrap();

        let err = streamer.get_event().await.unwrap_err();
        assert!(matches!(err, CanalError::Server { code: 1045, .. }));
        syncer.close().await;
    }

    #[tokio::test]
    async fn test_close_cancels_pending_get_event() {
        let (connector, _) = scripted(vec![Script::Events(vec![])]);
        let mut syncer = BinlogSyncer::with_connector(test_config(), connector);
        let mut streamer = syncer
            .start_sync(Position::new("mysql-bin.000001", 4))
            .await
            .unwrap();

        let waiter = tokio::spawn(async move { streamer.get_event().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        syncer.close().await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CanalError::Cancelled));
        assert!(syncer.is_closed());

        // closed syncers cannot restart
        let err = syncer
            .start_sync(Position::new("mysql-bin.000001", 4))
            .await
            .unwrap_err();
        assert!(matches!(err, CanalError::Cancelled));
    }

    #[tokio::test]
    async fn test_semi_sync_acks_flagged_events() {
        let enc = EventEncoder::new(1);
        let events = vec![
            enc.format_description("8.0.36"),
            with_pos(enc.query("test", "BEGIN"), 321),
        ];
        let (connector, recorded) = scripted(vec![Script::SemiSync(events)]);
        let config = test_config().with_semi_sync(true);
        let mut syncer = BinlogSyncer::with_connector(config, connector);
        let mut streamer = syncer
            .start_sync(Position::new("mysql-bin.000004", 4))
            .await
            .unwrap();

        streamer.get_event().await.unwrap();
        streamer.get_event().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        syncer.close().await;

        let recorded = recorded.lock().unwrap();
        assert!(recorded
            .queries
            .iter()
            .any(|q| q == "SET @rpl_semi_sync_slave = 1"));
        assert_eq!(recorded.acks.len(), 2);
        let mut r = ByteReader::new(&recorded.acks[1]);
        assert_eq!(r.u8().unwrap(), SEMI_SYNC_INDICATOR);
        assert_eq!(r.u64_le().unwrap(), 321);
        assert_eq!(r.rest(), b"mysql-bin.000004");
    }

    #[tokio::test]
    async fn test_streamer_channel() {
        let cancel = CancellationToken::new();
        let (tx, mut streamer) = BinlogStreamer::channel(4, cancel.clone());
        tx.send(Err(CanalError::protocol("boom"))).await.unwrap();
        assert!(matches!(
            streamer.get_event().await,
            Err(CanalError::Protocol(_))
        ));
        assert!(streamer
            .get_event_timeout(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
        drop(tx);
        assert!(matches!(
            streamer.get_event().await,
            Err(CanalError::ConnectionBroken(_))
        ));
        cancel.cancel();
        assert!(matches!(streamer.get_event().await, Err(CanalError::Cancelled)));
    }

    #[test]
    fn test_config_validate_and_debug() {
        assert!(SyncerConfig::default().validate().is_ok());
        assert!(SyncerConfig::default()
            .with_server_id(0)
            .validate()
            .is_err());
        let dbg = format!("{:?}", SyncerConfig::default().with_password("hunter2"));
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("REDACTED"));
    }

    #[test]
    fn test_split_semi_sync_packet() {
        let packet = Bytes::from_static(&[0x00, SEMI_SYNC_INDICATOR, 0x01, 0xAA]);
        let (body, ack) = split_event_packet(&packet, true).unwrap();
        assert_eq!(&body[..], &[0xAA]);
        assert!(ack);

        let (body, ack) = split_event_packet(&packet, false).unwrap();
        assert_eq!(body.len(), 3);
        assert!(!ack);
    }
}
