//! mycanal CLI - binlog tooling and a logging CDC runner
//!
//! - `gen-binlog` writes a synthetic binlog file
//! - `parse-binlog` prints the events of a binlog file
//! - `dump-binlog` streams raw binlog events from a live server
//! - `run` snapshots and streams changes from a server, logging every callback

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use mycanal::canal::RowsEvent;
use mycanal::mysql::{
    BinlogEvent, BinlogFileWriter, BinlogParser, EventData, EventEncoder, EventHeader,
    MysqlGtidSet, QueryEvent, RotateEvent, RowValue, RowsAction, RowsQueryEvent, TableMapEvent,
};
use mycanal::{
    BinlogSyncer, Canal, CanalConfig, CanalError, EventHandler, Flavor, GtidEventRef, GtidSet,
    Position, SyncerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "mycanal")]
#[command(about = "MySQL binlog replication and change data capture")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic binlog file
    GenBinlog {
        /// Output file
        output: PathBuf,

        /// Server id stamped on every event
        #[arg(long, default_value = "1")]
        server_id: u32,

        /// Number of rows inserted into `test`.`users`
        #[arg(short, long, default_value = "3")]
        rows: u32,

        /// Source UUID; when set, transactions carry GTIDs
        #[arg(long)]
        gtid_source: Option<Uuid>,

        /// Write events without CRC32 checksums
        #[arg(long)]
        no_checksum: bool,

        /// Rows event layout (1 or 2)
        #[arg(long, default_value = "2")]
        rows_version: u8,

        /// Binlog file the trailing rotate event points to
        #[arg(long, default_value = "mysql-bin.000002")]
        next_file: String,
    },

    /// Print the events of a binlog file
    ParseBinlog {
        /// Binlog file
        file: PathBuf,

        /// Start offset (0 or 4 means the first event)
        #[arg(short, long, default_value = "4")]
        offset: u64,

        /// Skip CRC32 verification
        #[arg(long)]
        no_verify_checksum: bool,

        /// Print row values
        #[arg(short, long)]
        verbose: bool,
    },

    /// Stream binlog events from a live server
    DumpBinlog {
        /// Server address, `host:port`
        #[arg(short, long, default_value = "127.0.0.1:3306", env = "MYCANAL_ADDR")]
        addr: String,

        #[arg(short, long, default_value = "root", env = "MYCANAL_USER")]
        user: String,

        #[arg(short, long, default_value = "", env = "MYCANAL_PASSWORD", hide_env_values = true)]
        password: String,

        /// Replica id announced to the server
        #[arg(long, default_value = "101")]
        server_id: u32,

        #[arg(long, default_value = "mysql")]
        flavor: Flavor,

        /// Start coordinates, `file:pos`
        #[arg(long, conflicts_with = "gtid")]
        position: Option<String>,

        /// Start after this GTID set
        #[arg(long)]
        gtid: Option<String>,

        /// Stop after this many events
        #[arg(short = 'n', long)]
        max_events: Option<u64>,

        /// Print row values
        #[arg(short, long)]
        verbose: bool,
    },

    /// Snapshot and stream changes, logging every callback
    Run {
        /// JSON canal configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Override the start coordinates, `file:pos`
        #[arg(long, conflicts_with = "gtid")]
        position: Option<String>,

        /// Override the start GTID set
        #[arg(long)]
        gtid: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::GenBinlog {
            output,
            server_id,
            rows,
            gtid_source,
            no_checksum,
            rows_version,
            next_file,
        } => {
            let plan = GenPlan {
                server_id,
                rows,
                gtid_source,
                checksum: !no_checksum,
                rows_version,
                next_file,
            };
            let count = generate_binlog(&output, &plan).await?;
            println!("✓ Wrote {} events to {}", count, output.display());
        }

        Commands::ParseBinlog {
            file,
            offset,
            no_verify_checksum,
            verbose,
        } => {
            let mut parser = BinlogParser::new().with_verify_checksum(!no_verify_checksum);
            let mut count = 0u64;
            parser
                .parse_file(&file, offset, |event| {
                    count += 1;
                    println!("{}", describe_event(&event, verbose));
                    Ok(())
                })
                .await
                .with_context(|| format!("failed to parse {}", file.display()))?;
            println!("{} events", count);
        }

        Commands::DumpBinlog {
            addr,
            user,
            password,
            server_id,
            flavor,
            position,
            gtid,
            max_events,
            verbose,
        } => {
            let (host, port) = split_addr(&addr)?;
            let config = SyncerConfig::new(host, port, user)
                .with_password(password)
                .with_server_id(server_id)
                .with_flavor(flavor);
            let mut syncer = BinlogSyncer::new(config);

            let mut streamer = match start_point(position.as_deref(), gtid.as_deref(), flavor)? {
                StartPoint::Gtid(set) => syncer.start_sync_gtid(set).await?,
                StartPoint::Position(pos) => syncer.start_sync(pos).await?,
                StartPoint::Saved => syncer.start_sync(Position::default()).await?,
            };

            let mut seen = 0u64;
            loop {
                tokio::select! {
                    event = streamer.get_event() => {
                        let event = event?;
                        println!("{}", describe_event(&event, verbose));
                        seen += 1;
                        if max_events.is_some_and(|max| seen >= max) {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        println!("\nStopping...");
                        break;
                    }
                }
            }
            syncer.close().await;
        }

        Commands::Run {
            config,
            position,
            gtid,
        } => {
            let text = tokio::fs::read_to_string(&config)
                .await
                .with_context(|| format!("failed to read {}", config.display()))?;
            let canal_config = CanalConfig::from_json(&text)?;
            let start = start_point(position.as_deref(), gtid.as_deref(), canal_config.flavor)?;
            let canal = Canal::new(canal_config, Arc::new(LoggingHandler)).await?;

            let runner = canal.clone();
            let mut task = tokio::spawn(async move {
                match start {
                    StartPoint::Gtid(set) => runner.start_from_gtid(set).await,
                    StartPoint::Position(pos) => runner.run_from(pos).await,
                    StartPoint::Saved => runner.run().await,
                }
            });

            tokio::select! {
                result = &mut task => {
                    result??;
                }
                _ = tokio::signal::ctrl_c() => {
                    println!("\nShutting down...");
                    canal.close().await;
                    task.await??;
                }
            }
            info!("Stopped at {}", canal.synced_position());
        }
    }

    Ok(())
}

/// Where replication starts.
#[derive(Debug, PartialEq)]
enum StartPoint {
    /// Stored coordinates, or the server's current ones
    Saved,
    Position(Position),
    Gtid(GtidSet),
}

/// Resolve the `--position`/`--gtid` flags; a GTID set wins.
fn start_point(
    position: Option<&str>,
    gtid: Option<&str>,
    flavor: Flavor,
) -> anyhow::Result<StartPoint> {
    match (position, gtid) {
        (_, Some(gtid)) => Ok(StartPoint::Gtid(
            GtidSet::parse(flavor, gtid).context("invalid GTID set")?,
        )),
        (Some(pos), None) => Ok(StartPoint::Position(parse_position(pos)?)),
        (None, None) => Ok(StartPoint::Saved),
    }
}

/// Parse `file:pos` coordinates.
fn parse_position(s: &str) -> anyhow::Result<Position> {
    let (name, pos) = s
        .rsplit_once(':')
        .with_context(|| format!("position '{}' is not file:pos", s))?;
    let pos = pos
        .parse::<u32>()
        .with_context(|| format!("invalid offset in position '{}'", s))?;
    if name.is_empty() {
        bail!("position '{}' has no file name", s);
    }
    Ok(Position::new(name, pos))
}

fn split_addr(addr: &str) -> anyhow::Result<(String, u16)> {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port in address '{}'", addr))?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), 3306)),
    }
}

struct GenPlan {
    server_id: u32,
    rows: u32,
    gtid_source: Option<Uuid>,
    checksum: bool,
    rows_version: u8,
    next_file: String,
}

fn users_table() -> TableMapEvent {
    TableMapEvent {
        table_id: 100,
        flags: 1,
        schema: "test".into(),
        table: "users".into(),
        column_count: 3,
        // int, varchar(64) utf8mb4, bigint unsigned
        column_types: vec![3, 15, 8],
        column_meta: vec![0, 256, 0],
        null_bitmap: vec![0b0000_0110],
        signedness_bitmap: Some(vec![0b0100_0000]),
        column_names: vec!["id".into(), "name".into(), "visits".into()],
        primary_key: vec![0],
    }
}

fn user_row(id: u32) -> Vec<RowValue> {
    vec![
        RowValue::Int32(id as i32),
        RowValue::String(format!("user-{}", id)),
        RowValue::UInt64(u64::from(id) * 10),
    ]
}

/// Write a small replication history: a create, one insert transaction,
/// one update transaction and a rotate. Returns the event count.
async fn generate_binlog(path: &std::path::Path, plan: &GenPlan) -> anyhow::Result<usize> {
    let encoder = EventEncoder::new(plan.server_id)
        .with_checksum(plan.checksum)
        .with_timestamp(unix_now());
    let table = users_table();

    let mut events = vec![encoder.format_description("8.0.36-mycanal")];
    let mut gno = 0i64;
    let mut next_gtid = |events: &mut Vec<bytes::Bytes>| {
        if let Some(sid) = plan.gtid_source {
            gno += 1;
            events.push(encoder.gtid(sid, gno, gno - 1, gno));
        }
    };

    if plan.gtid_source.is_some() {
        events.push(encoder.previous_gtids(&MysqlGtidSet::new()));
    }

    next_gtid(&mut events);
    events.push(encoder.query(
        "test",
        "CREATE TABLE users (id INT PRIMARY KEY, name VARCHAR(64), visits BIGINT UNSIGNED)",
    ));

    next_gtid(&mut events);
    events.push(encoder.query("test", "BEGIN"));
    events.push(encoder.table_map(&table)?);
    let inserted: Vec<Vec<RowValue>> = (1..=plan.rows).map(user_row).collect();
    events.push(encoder.rows(plan.rows_version, RowsAction::Insert, &table, &inserted)?);
    events.push(encoder.xid(1));

    if plan.rows > 0 {
        next_gtid(&mut events);
        let before = user_row(1);
        let mut after = before.clone();
        after[2] = RowValue::UInt64(11);
        events.push(encoder.query("test", "BEGIN"));
        events.push(encoder.table_map(&table)?);
        events.push(encoder.rows(plan.rows_version, RowsAction::Update, &table, &[before, after])?);
        events.push(encoder.xid(2));
    }

    events.push(encoder.rotate(&plan.next_file, 4));

    let mut writer = BinlogFileWriter::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    for event in &events {
        writer.append(event).await?;
    }
    writer.finish().await?;
    Ok(events.len())
}

fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn describe_event(event: &BinlogEvent, verbose: bool) -> String {
    let h = &event.header;
    let detail = match &event.event {
        EventData::FormatDescription(fde) => format!(
            "version={} checksum={}",
            fde.server_version,
            fde.has_crc32()
        ),
        EventData::Rotate(r) => format!("next={} pos={}", r.next_log_name, r.position),
        EventData::Query(q) => format!("schema={} query={}", q.schema, q.query),
        EventData::TableMap(t) => format!("table_id={} {}.{}", t.table_id, t.schema, t.table),
        EventData::Rows(r) => {
            let mut s = format!(
                "{} {}.{} rows={}",
                r.action.as_str(),
                r.table.schema,
                r.table.table,
                r.rows.len()
            );
            if verbose {
                for row in &r.rows {
                    let values: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                    s.push_str(&format!("\n    [{}]", values.join(", ")));
                }
            }
            s
        }
        EventData::Xid(x) => format!("xid={}", x.xid),
        EventData::Gtid(g) => format!("gtid={}", g.gtid()),
        EventData::PreviousGtids(p) => format!("set={}", p.gtid_set),
        EventData::Heartbeat(hb) => format!("log={}", hb.log_name),
        EventData::RowsQuery(q) => format!("query={}", q.query),
        EventData::MariadbGtid(g) => format!("gtid={}", g.gtid),
        EventData::MariadbGtidList(l) => {
            let gtids: Vec<String> = l.gtids.iter().map(|g| g.to_string()).collect();
            format!("gtids={}", gtids.join(","))
        }
        EventData::Generic(body) => format!("{} bytes", body.len()),
    };
    format!(
        "[{:?}] server_id={} log_pos={} size={} {}",
        h.event_type, h.server_id, h.log_pos, h.event_size, detail
    )
}

/// Handler that logs every notification.
struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn on_rotate(&self, _header: &EventHeader, rotate: &RotateEvent) -> mycanal::Result<()> {
        info!("rotate to {}:{}", rotate.next_log_name, rotate.position);
        Ok(())
    }

    async fn on_table_changed(
        &self,
        _header: &EventHeader,
        schema: &str,
        table: &str,
    ) -> mycanal::Result<()> {
        info!("table changed: {}.{}", schema, table);
        Ok(())
    }

    async fn on_ddl(
        &self,
        _header: &EventHeader,
        next_pos: &Position,
        query: &QueryEvent,
    ) -> mycanal::Result<()> {
        info!("ddl at {}: {}", next_pos, query.query);
        Ok(())
    }

    async fn on_row(&self, event: &RowsEvent) -> mycanal::Result<()> {
        info!("{}", event.to_json());
        Ok(())
    }

    async fn on_xid(&self, _header: &EventHeader, next_pos: &Position) -> mycanal::Result<()> {
        info!("commit at {}", next_pos);
        Ok(())
    }

    async fn on_gtid(&self, _header: &EventHeader, gtid: GtidEventRef<'_>) -> mycanal::Result<()> {
        info!("gtid {}", gtid.gtid_next());
        Ok(())
    }

    async fn on_pos_synced(
        &self,
        _header: Option<&EventHeader>,
        pos: &Position,
        gtid_set: Option<&GtidSet>,
        force: bool,
    ) -> mycanal::Result<()> {
        match gtid_set {
            Some(set) => info!("synced {} gtid={} force={}", pos, set, force),
            None => info!("synced {} force={}", pos, force),
        }
        Ok(())
    }

    async fn on_rows_query(
        &self,
        _header: &EventHeader,
        event: &RowsQueryEvent,
    ) -> mycanal::Result<()> {
        info!("rows query: {}", event.query);
        Ok(())
    }

    fn is_ddl_error_recoverable(&self, err: &CanalError) -> bool {
        warn!("ddl handler failed: {}", err);
        true
    }

    fn name(&self) -> &str {
        "LoggingHandler"
    }
}
