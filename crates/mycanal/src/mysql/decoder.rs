//! MySQL binlog event decoder
//!
//! Decodes raw binlog events (header + body + optional CRC32) into typed
//! [`BinlogEvent`]s. The parser keeps the current format description, which
//! decides the checksum algorithm and table id width, and the table map
//! events seen so far, which rows events are decoded against.

use super::codec::{bit_is_set, bitmap_len, count_set_bits, ByteReader};
use super::event::*;
use super::gtid::{MariadbGtid, MysqlGtidSet};
use super::json::decode_json;
use crate::common::{CanalError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};
use uuid::Uuid;

/// FormatDescription fixed part: version(2) + server version(50) + create ts(4) + header len(1)
const FDE_FIXED_LEN: usize = 57;
/// Table id used by rows events that carry no table (statement end markers)
const DUMMY_TABLE_ID: u64 = 0x00FF_FFFF;

const TABLE_MAP_OPT_SIGNEDNESS: u8 = 1;
const TABLE_MAP_OPT_COLUMN_NAME: u8 = 4;
const TABLE_MAP_OPT_SIMPLE_PRIMARY_KEY: u8 = 8;

const GTID_LOGICAL_TIMESTAMP_TYPE: u8 = 2;

const TIMEF_OFS: i64 = 0x8000_0000_0000;
const TIMEF_INT_OFS: i64 = 0x80_0000;
const DATETIMEF_INT_OFS: i64 = 0x80_0000_0000;

/// Stateful binlog event parser.
#[derive(Debug, Clone)]
pub struct BinlogParser {
    format: Option<FormatDescriptionEvent>,
    tables: HashMap<u64, Arc<TableMapEvent>>,
    verify_checksum: bool,
    /// Checksum state assumed for events preceding the first format description
    checksum_before_format: bool,
}

impl Default for BinlogParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BinlogParser {
    pub fn new() -> Self {
        Self {
            format: None,
            tables: HashMap::new(),
            verify_checksum: true,
            checksum_before_format: false,
        }
    }

    pub fn with_verify_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    pub fn set_verify_checksum(&mut self, verify: bool) {
        self.verify_checksum = verify;
    }

    /// A checksum-aware dump starts with a fake rotate that already carries a
    /// CRC32 trailer, before any format description has been sent.
    pub fn with_checksum_before_format(mut self, crc32: bool) -> Self {
        self.checksum_before_format = crc32;
        self
    }

    /// Current format description, if one has been seen.
    pub fn format(&self) -> Option<&FormatDescriptionEvent> {
        self.format.as_ref()
    }

    pub fn table(&self, table_id: u64) -> Option<Arc<TableMapEvent>> {
        self.tables.get(&table_id).cloned()
    }

    /// Forget the format description and all table maps (new binlog file).
    pub fn reset(&mut self) {
        self.format = None;
        self.tables.clear();
    }

    /// Decode one complete event.
    pub fn parse_event(&mut self, raw: Bytes) -> Result<BinlogEvent> {
        if raw.len() < EVENT_HEADER_SIZE {
            return Err(CanalError::protocol(format!(
                "event too short: {} bytes",
                raw.len()
            )));
        }
        let header = EventHeader::parse(&raw)?;
        if header.event_size as usize != raw.len() {
            return Err(CanalError::protocol(format!(
                "invalid event size {}, header says {}",
                raw.len(),
                header.event_size
            )));
        }

        let body = &raw[EVENT_HEADER_SIZE..];
        let event = if header.event_type == EventType::FormatDescription {
            let fde = decode_format_description(body)?;
            if fde.has_crc32() {
                self.verify_crc32(&raw)?;
            }
            debug!(
                server_version = %fde.server_version,
                checksum = fde.checksum_algorithm,
                "format description"
            );
            self.format = Some(fde.clone());
            EventData::FormatDescription(fde)
        } else {
            let crc32 = match &self.format {
                Some(format) => format.has_crc32(),
                None => self.checksum_before_format,
            };
            let body = if crc32 {
                self.verify_crc32(&raw)?;
                &body[..body.len().saturating_sub(BINLOG_CHECKSUM_LEN)]
            } else {
                body
            };
            self.decode_body(&header, body)?
        };

        trace!(event_type = %header.event_type, log_pos = header.log_pos, "decoded event");
        Ok(BinlogEvent { header, event, raw })
    }

    fn verify_crc32(&self, raw: &[u8]) -> Result<()> {
        if !self.verify_checksum || raw.len() < EVENT_HEADER_SIZE + BINLOG_CHECKSUM_LEN {
            return Ok(());
        }
        let split = raw.len() - BINLOG_CHECKSUM_LEN;
        let expected = u32::from_le_bytes([raw[split], raw[split + 1], raw[split + 2], raw[split + 3]]);
        let computed = crc32fast::hash(&raw[..split]);
        if expected != computed {
            return Err(CanalError::ChecksumMismatch { expected, computed });
        }
        Ok(())
    }

    fn table_id_size(&self, event_type: EventType) -> usize {
        self.format
            .as_ref()
            .map(|f| f.table_id_size(event_type))
            .unwrap_or(6)
    }

    fn decode_body(&mut self, header: &EventHeader, body: &[u8]) -> Result<EventData> {
        let event_type = header.event_type;
        if let Some((version, action)) = event_type.rows_kind() {
            return self.decode_rows(event_type, version, action, body);
        }

        Ok(match event_type {
            EventType::Rotate => EventData::Rotate(decode_rotate(body)?),
            EventType::Query => EventData::Query(decode_query(body)?),
            EventType::Xid => {
                let mut r = ByteReader::new(body);
                EventData::Xid(XidEvent {
                    xid: r.u64_le()?,
                    gtid_set: None,
                })
            }
            EventType::TableMap => {
                let table = Arc::new(decode_table_map(
                    body,
                    self.table_id_size(EventType::TableMap),
                )?);
                self.tables.insert(table.table_id, table.clone());
                EventData::TableMap(table)
            }
            EventType::Gtid | EventType::AnonymousGtid => {
                EventData::Gtid(decode_gtid(body, event_type == EventType::AnonymousGtid)?)
            }
            EventType::PreviousGtids => EventData::PreviousGtids(PreviousGtidsEvent {
                gtid_set: MysqlGtidSet::decode(body)?,
            }),
            EventType::Heartbeat => EventData::Heartbeat(HeartbeatEvent {
                log_name: String::from_utf8_lossy(body).into_owned(),
            }),
            EventType::HeartbeatV2 => EventData::Heartbeat(decode_heartbeat_v2(body)?),
            EventType::RowsQuery => {
                // one length byte, truncated for long statements, then the text
                let text = body.get(1..).unwrap_or_default();
                EventData::RowsQuery(RowsQueryEvent {
                    query: String::from_utf8_lossy(text).into_owned(),
                })
            }
            EventType::MariadbAnnotateRows => EventData::RowsQuery(RowsQueryEvent {
                query: String::from_utf8_lossy(body).into_owned(),
            }),
            EventType::MariadbGtid => {
                let mut r = ByteReader::new(body);
                let sequence_number = r.u64_le()?;
                let domain_id = r.u32_le()?;
                let flags = r.u8()?;
                EventData::MariadbGtid(MariadbGtidEvent {
                    gtid: MariadbGtid {
                        domain_id,
                        server_id: header.server_id,
                        sequence_number,
                    },
                    flags,
                })
            }
            EventType::MariadbGtidList => EventData::MariadbGtidList(decode_gtid_list(body)?),
            EventType::TransactionPayload
            | EventType::GtidTagged
            | EventType::MariadbQueryCompressed
            | EventType::MariadbWriteRowsCompressedV1
            | EventType::MariadbUpdateRowsCompressedV1
            | EventType::MariadbDeleteRowsCompressedV1 => {
                return Err(CanalError::UnsupportedEvent(event_type.code()))
            }
            EventType::Other(code) => {
                if header.is_ignorable() {
                    debug!(code, "skipping ignorable unknown event");
                    EventData::Generic(Bytes::copy_from_slice(body))
                } else {
                    return Err(CanalError::UnsupportedEvent(code));
                }
            }
            _ => EventData::Generic(Bytes::copy_from_slice(body)),
        })
    }

    fn decode_rows(
        &self,
        event_type: EventType,
        version: u8,
        action: RowsAction,
        body: &[u8],
    ) -> Result<EventData> {
        let mut r = ByteReader::new(body);
        let table_id = r.uint_le(self.table_id_size(event_type))?;
        let flags = r.u16_le()?;

        let extra_data = if version == 2 {
            let len = r.u16_le()? as usize;
            Bytes::copy_from_slice(r.bytes(len.saturating_sub(2))?)
        } else {
            Bytes::new()
        };

        let column_count = r.packed_int()?;
        let bitmap_size = bitmap_len(column_count as usize);
        let columns_present = r.bytes(bitmap_size)?.to_vec();
        let columns_present_after = if action == RowsAction::Update {
            r.bytes(bitmap_size)?.to_vec()
        } else {
            Vec::new()
        };

        let table = match self.tables.get(&table_id) {
            Some(t) => t.clone(),
            None if table_id == DUMMY_TABLE_ID => {
                return Ok(EventData::Generic(Bytes::copy_from_slice(body)))
            }
            None => {
                return Err(CanalError::protocol(format!(
                    "invalid table id {}, no corresponding table map event",
                    table_id
                )))
            }
        };

        let mut rows = Vec::new();
        while !r.is_empty() {
            rows.push(decode_row(&mut r, &table, column_count, &columns_present)?);
            if action == RowsAction::Update {
                rows.push(decode_row(
                    &mut r,
                    &table,
                    column_count,
                    &columns_present_after,
                )?);
            }
        }

        Ok(EventData::Rows(BinlogRowsEvent {
            version,
            action,
            table_id,
            flags,
            extra_data,
            column_count,
            columns_present,
            columns_present_after,
            table,
            rows,
        }))
    }

    /// Read a binlog file, calling `on_event` for every event from `offset`
    /// (0 or 4 means the first event).
    pub async fn parse_file<F>(&mut self, path: impl AsRef<Path>, offset: u64, mut on_event: F) -> Result<()>
    where
        F: FnMut(BinlogEvent) -> Result<()>,
    {
        let path = path.as_ref();
        let mut file = tokio::io::BufReader::new(tokio::fs::File::open(path).await?);

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic).await?;
        if magic != BINLOG_FILE_HEADER {
            return Err(CanalError::protocol(format!(
                "{} is not a binlog file",
                path.display()
            )));
        }

        self.reset();
        let mut pos = BINLOG_FILE_HEADER.len() as u64;
        loop {
            let mut header = [0u8; EVENT_HEADER_SIZE];
            match file.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            let size = EventHeader::parse(&header)?.event_size as usize;
            if size < EVENT_HEADER_SIZE {
                return Err(CanalError::protocol(format!("invalid event size {} at {}", size, pos)));
            }
            let mut raw = vec![0u8; size];
            raw[..EVENT_HEADER_SIZE].copy_from_slice(&header);
            file.read_exact(&mut raw[EVENT_HEADER_SIZE..]).await?;

            // the format description is always needed to decode what follows
            let event = self.parse_event(Bytes::from(raw))?;
            let is_fde = event.header.event_type == EventType::FormatDescription;
            if pos >= offset || is_fde {
                on_event(event)?;
            }
            pos += size as u64;
        }
    }
}

// ============================================================================
// Event bodies
// ============================================================================

fn decode_format_description(body: &[u8]) -> Result<FormatDescriptionEvent> {
    let mut r = ByteReader::new(body);
    let binlog_version = r.u16_le()?;
    let server_version = String::from_utf8_lossy(r.bytes(50)?)
        .trim_end_matches('\0')
        .to_string();
    let create_timestamp = r.u32_le()?;
    let event_header_length = r.u8()?;
    if usize::from(event_header_length) != EVENT_HEADER_SIZE {
        return Err(CanalError::protocol(format!(
            "invalid event header length {}, must be {}",
            event_header_length, EVENT_HEADER_SIZE
        )));
    }

    // checksum aware servers append the algorithm byte and 4 checksum bytes
    let (event_type_header_lengths, checksum_algorithm) =
        if server_supports_checksum(&server_version) && body.len() >= FDE_FIXED_LEN + 5 {
            (
                body[FDE_FIXED_LEN..body.len() - 5].to_vec(),
                body[body.len() - 5],
            )
        } else {
            (body[FDE_FIXED_LEN..].to_vec(), BINLOG_CHECKSUM_ALG_UNDEF)
        };

    Ok(FormatDescriptionEvent {
        binlog_version,
        server_version,
        create_timestamp,
        event_header_length,
        event_type_header_lengths,
        checksum_algorithm,
    })
}

/// MySQL 5.6.1 and MariaDB 5.3 introduced binlog checksums.
pub fn server_supports_checksum(version: &str) -> bool {
    let product = version_product(version);
    if version.to_ascii_lowercase().contains("mariadb") {
        product >= version_product("5.3.0")
    } else {
        product >= version_product("5.6.1")
    }
}

fn version_product(version: &str) -> u64 {
    let mut parts = version.splitn(3, '.').map(|p| {
        p.chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse::<u64>()
            .unwrap_or(0)
    });
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    (major << 16) + (minor << 8) + patch
}

fn decode_rotate(body: &[u8]) -> Result<RotateEvent> {
    let mut r = ByteReader::new(body);
    let position = r.u64_le()?;
    let next_log_name = String::from_utf8_lossy(r.rest())
        .trim_end_matches('\0')
        .to_string();
    Ok(RotateEvent {
        position,
        next_log_name,
    })
}

fn decode_query(body: &[u8]) -> Result<QueryEvent> {
    let mut r = ByteReader::new(body);
    let slave_proxy_id = r.u32_le()?;
    let execution_time = r.u32_le()?;
    let schema_len = r.u8()? as usize;
    let error_code = r.u16_le()?;
    let status_len = r.u16_le()? as usize;
    let status_vars = Bytes::copy_from_slice(r.bytes(status_len)?);
    let schema = String::from_utf8_lossy(r.bytes(schema_len)?).into_owned();
    r.skip(1)?;
    let query = String::from_utf8_lossy(r.rest()).into_owned();
    Ok(QueryEvent {
        slave_proxy_id,
        execution_time,
        error_code,
        status_vars,
        schema,
        query,
        gtid_set: None,
    })
}

fn decode_gtid(body: &[u8], anonymous: bool) -> Result<GtidEvent> {
    let mut r = ByteReader::new(body);
    let commit_flag = r.u8()?;
    let sid = Uuid::from_slice(r.bytes(16)?)
        .map_err(|e| CanalError::protocol(format!("invalid GTID source id: {}", e)))?;
    let gno = r.i64_le()?;

    let (mut last_committed, mut sequence_number) = (None, None);
    if r.remaining() >= 17 && r.u8()? == GTID_LOGICAL_TIMESTAMP_TYPE {
        last_committed = Some(r.i64_le()?);
        sequence_number = Some(r.i64_le()?);
    }

    Ok(GtidEvent {
        commit_flag,
        sid,
        gno,
        last_committed,
        sequence_number,
        tag: None,
        anonymous,
    })
}

fn decode_heartbeat_v2(body: &[u8]) -> Result<HeartbeatEvent> {
    const LOG_FILENAME_FIELD: u8 = 1;

    let mut r = ByteReader::new(body);
    let mut log_name = String::new();
    while !r.is_empty() {
        let field = r.u8()?;
        if field == 0 {
            break;
        }
        let len = r.packed_int()? as usize;
        let value = r.bytes(len)?;
        if field == LOG_FILENAME_FIELD {
            log_name = String::from_utf8_lossy(value).into_owned();
        }
    }
    Ok(HeartbeatEvent { log_name })
}

fn decode_gtid_list(body: &[u8]) -> Result<MariadbGtidListEvent> {
    let mut r = ByteReader::new(body);
    let count = r.u32_le()? & ((1 << 28) - 1);
    // 16 bytes per entry
    let mut gtids = Vec::with_capacity((count as usize).min(body.len() / 16));
    for _ in 0..count {
        let domain_id = r.u32_le()?;
        let server_id = r.u32_le()?;
        let sequence_number = r.u64_le()?;
        gtids.push(MariadbGtid {
            domain_id,
            server_id,
            sequence_number,
        });
    }
    Ok(MariadbGtidListEvent { gtids })
}

fn decode_table_map(body: &[u8], table_id_size: usize) -> Result<TableMapEvent> {
    let mut r = ByteReader::new(body);
    let table_id = r.uint_le(table_id_size)?;
    let flags = r.u16_le()?;

    let schema_len = r.u8()? as usize;
    let schema = String::from_utf8_lossy(r.bytes(schema_len)?).into_owned();
    r.skip(1)?;
    let table_len = r.u8()? as usize;
    let table = String::from_utf8_lossy(r.bytes(table_len)?).into_owned();
    r.skip(1)?;

    let column_count = r.packed_int()?;
    let column_types = r.bytes(column_count as usize)?.to_vec();
    let meta_block = r
        .lenenc_bytes()?
        .ok_or_else(|| CanalError::protocol("missing table map metadata"))?;
    let column_meta = decode_column_meta(&column_types, meta_block)?;
    let null_bitmap = r.bytes(bitmap_len(column_count as usize))?.to_vec();

    let mut event = TableMapEvent {
        table_id,
        flags,
        schema,
        table,
        column_count,
        column_types,
        column_meta,
        null_bitmap,
        signedness_bitmap: None,
        column_names: Vec::new(),
        primary_key: Vec::new(),
    };
    decode_optional_meta(&mut event, r.rest())?;
    Ok(event)
}

fn decode_column_meta(column_types: &[u8], block: &[u8]) -> Result<Vec<u16>> {
    let mut r = ByteReader::new(block);
    column_types
        .iter()
        .map(|&t| {
            let column_type = ColumnType::from_u8(t)
                .ok_or_else(|| CanalError::protocol(format!("unknown column type {}", t)))?;
            Ok(match column_type {
                // real type and length, high byte first
                ColumnType::String | ColumnType::NewDecimal => r.uint_be(2)? as u16,
                ColumnType::VarString | ColumnType::VarChar | ColumnType::Bit => r.u16_le()?,
                ColumnType::Blob
                | ColumnType::Double
                | ColumnType::Float
                | ColumnType::Geometry
                | ColumnType::Json
                | ColumnType::Time2
                | ColumnType::DateTime2
                | ColumnType::Timestamp2 => u16::from(r.u8()?),
                ColumnType::NewDate
                | ColumnType::Enum
                | ColumnType::Set
                | ColumnType::TinyBlob
                | ColumnType::MediumBlob
                | ColumnType::LongBlob
                | ColumnType::TypedArray => {
                    return Err(CanalError::protocol(format!(
                        "unsupported column type {:?} in table map",
                        column_type
                    )))
                }
                _ => 0,
            })
        })
        .collect()
}

/// Optional metadata is a list of (type u8, length, value) fields.
fn decode_optional_meta(event: &mut TableMapEvent, data: &[u8]) -> Result<()> {
    let mut r = ByteReader::new(data);
    while !r.is_empty() {
        let field = r.u8()?;
        let len = r.packed_int()? as usize;
        let value = r.bytes(len)?;
        match field {
            TABLE_MAP_OPT_SIGNEDNESS => event.signedness_bitmap = Some(value.to_vec()),
            TABLE_MAP_OPT_COLUMN_NAME => {
                let mut names = ByteReader::new(value);
                while !names.is_empty() {
                    event.column_names.push(names.lenenc_string()?);
                }
            }
            TABLE_MAP_OPT_SIMPLE_PRIMARY_KEY => {
                let mut keys = ByteReader::new(value);
                while !keys.is_empty() {
                    event.primary_key.push(keys.packed_int()?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ============================================================================
// Row values
// ============================================================================

fn decode_row(
    r: &mut ByteReader<'_>,
    table: &TableMapEvent,
    column_count: u64,
    present: &[u8],
) -> Result<Vec<RowValue>> {
    let column_count = column_count as usize;
    let null_bitmap = r.bytes(bitmap_len(count_set_bits(present, column_count)))?;

    let mut row = Vec::with_capacity(column_count);
    let mut null_idx = 0;
    for i in 0..column_count {
        if !bit_is_set(present, i) {
            row.push(RowValue::Null);
            continue;
        }
        let is_null = bit_is_set(null_bitmap, null_idx);
        null_idx += 1;
        if is_null {
            row.push(RowValue::Null);
            continue;
        }

        let column_type = *table.column_types.get(i).ok_or_else(|| {
            CanalError::protocol(format!(
                "column {} out of range for table {}.{}",
                i, table.schema, table.table
            ))
        })?;
        let meta = table.column_meta.get(i).copied().unwrap_or(0);
        row.push(decode_value(r, column_type, meta)?);
    }
    Ok(row)
}

fn decode_value(r: &mut ByteReader<'_>, column_type: u8, meta: u16) -> Result<RowValue> {
    let mut column_type = ColumnType::from_u8(column_type)
        .ok_or_else(|| CanalError::protocol(format!("unknown column type {}", column_type)))?;

    let mut length = 0usize;
    if column_type == ColumnType::String {
        if meta >= 256 {
            let b0 = (meta >> 8) as u8;
            let b1 = (meta & 0xFF) as u8;
            if b0 & 0x30 != 0x30 {
                length = usize::from(b1) | (usize::from((b0 & 0x30) ^ 0x30) << 4);
                column_type = ColumnType::from_u8(b0 | 0x30).unwrap_or(ColumnType::String);
            } else {
                length = usize::from(b1);
                column_type = ColumnType::from_u8(b0).unwrap_or(ColumnType::String);
            }
        } else {
            length = usize::from(meta);
        }
    }

    Ok(match column_type {
        ColumnType::Null => RowValue::Null,
        ColumnType::Tiny => RowValue::Int8(r.u8()? as i8),
        ColumnType::Short => RowValue::Int16(r.u16_le()? as i16),
        ColumnType::Int24 => {
            let v = r.u24_le()?;
            // sign extend from 24 bits
            RowValue::Int32(((v << 8) as i32) >> 8)
        }
        ColumnType::Long => RowValue::Int32(r.u32_le()? as i32),
        ColumnType::LongLong => RowValue::Int64(r.i64_le()?),
        ColumnType::Float => RowValue::Float(f32::from_bits(r.u32_le()?)),
        ColumnType::Double => RowValue::Double(f64::from_bits(r.u64_le()?)),
        ColumnType::NewDecimal => {
            RowValue::Decimal(decode_decimal(r, usize::from(meta >> 8), usize::from(meta & 0xFF))?)
        }
        ColumnType::Bit => {
            let nbits = usize::from(meta >> 8) * 8 + usize::from(meta & 0xFF);
            let n = nbits.div_ceil(8);
            RowValue::Bit(if nbits > 1 { r.uint_be(n)? } else { u64::from(r.u8()?) })
        }
        ColumnType::Timestamp => RowValue::Timestamp(format_timestamp(i64::from(r.u32_le()?), 0, 0)),
        ColumnType::Timestamp2 => {
            let secs = r.uint_be(4)? as i64;
            let frac = read_fraction(r, meta)?;
            RowValue::Timestamp(format_timestamp(secs, frac, meta))
        }
        ColumnType::DateTime => RowValue::DateTime(decode_datetime(r.u64_le()?)),
        ColumnType::DateTime2 => RowValue::DateTime(decode_datetime2(r, meta)?),
        ColumnType::Time => RowValue::Time(decode_time(r.u24_le()?)),
        ColumnType::Time2 => RowValue::Time(decode_time2(r, meta)?),
        ColumnType::Date => {
            let v = r.u24_le()?;
            RowValue::Date(if v == 0 {
                "0000-00-00".to_string()
            } else {
                format!("{:04}-{:02}-{:02}", v >> 9, (v >> 5) % 16, v % 32)
            })
        }
        ColumnType::Year => {
            let v = r.u8()?;
            RowValue::Year(if v == 0 { 0 } else { u16::from(v) + 1900 })
        }
        ColumnType::Enum => match meta & 0xFF {
            1 => RowValue::Enum(i64::from(r.u8()?)),
            2 => RowValue::Enum(i64::from(r.u16_le()?)),
            n => return Err(CanalError::protocol(format!("unknown ENUM packlen {}", n))),
        },
        ColumnType::Set => RowValue::Set(r.uint_le(usize::from(meta & 0xFF))?),
        ColumnType::Blob | ColumnType::Geometry => {
            let len = r.uint_le(usize::from(meta))? as usize;
            RowValue::Bytes(Bytes::copy_from_slice(r.bytes(len)?))
        }
        ColumnType::VarChar | ColumnType::VarString => text_value(read_string(r, usize::from(meta))?),
        ColumnType::String => text_value(read_string(r, length)?),
        ColumnType::Json => {
            let len = r.uint_le(usize::from(meta))? as usize;
            RowValue::Json(decode_json(r.bytes(len)?)?)
        }
        other => {
            return Err(CanalError::protocol(format!(
                "unsupported column type {:?} in rows event",
                other
            )))
        }
    })
}

fn read_string<'a>(r: &mut ByteReader<'a>, length: usize) -> Result<&'a [u8]> {
    let len = if length < 256 {
        usize::from(r.u8()?)
    } else {
        usize::from(r.u16_le()?)
    };
    r.bytes(len)
}

fn text_value(bytes: &[u8]) -> RowValue {
    match std::str::from_utf8(bytes) {
        Ok(s) => RowValue::String(s.to_string()),
        Err(_) => RowValue::Bytes(Bytes::copy_from_slice(bytes)),
    }
}

/// Fractional seconds as microseconds.
fn read_fraction(r: &mut ByteReader<'_>, dec: u16) -> Result<i64> {
    Ok(match dec {
        1 | 2 => r.u8()? as i64 * 10_000,
        3 | 4 => r.uint_be(2)? as i64 * 100,
        5 | 6 => r.uint_be(3)? as i64,
        _ => 0,
    })
}

fn fraction_suffix(micros: i64, dec: u16) -> String {
    if dec == 0 {
        return String::new();
    }
    let digits = format!("{:06}", micros);
    format!(".{}", &digits[..usize::from(dec.min(6))])
}

fn format_timestamp(secs: i64, micros: i64, dec: u16) -> String {
    if secs == 0 {
        return format!("0000-00-00 00:00:00{}", fraction_suffix(micros, dec));
    }
    match chrono::DateTime::from_timestamp(secs, 0) {
        Some(t) => format!(
            "{}{}",
            t.format("%Y-%m-%d %H:%M:%S"),
            fraction_suffix(micros, dec)
        ),
        None => secs.to_string(),
    }
}

fn decode_datetime(v: u64) -> String {
    if v == 0 {
        return "0000-00-00 00:00:00".to_string();
    }
    let d = v / 1_000_000;
    let t = v % 1_000_000;
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        d / 10_000,
        (d % 10_000) / 100,
        d % 100,
        t / 10_000,
        (t % 10_000) / 100,
        t % 100
    )
}

fn decode_datetime2(r: &mut ByteReader<'_>, dec: u16) -> Result<String> {
    let int_part = r.uint_be(5)? as i64 - DATETIMEF_INT_OFS;
    let frac = read_fraction(r, dec)?;
    if int_part == 0 {
        return Ok(format!("0000-00-00 00:00:00{}", fraction_suffix(frac, dec)));
    }

    let ymdhms = int_part.abs();
    let ymd = ymdhms >> 17;
    let ym = ymd >> 5;
    let hms = ymdhms % (1 << 17);

    Ok(format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}{}",
        ym / 13,
        ym % 13,
        ymd % (1 << 5),
        hms >> 12,
        (hms >> 6) % (1 << 6),
        hms % (1 << 6),
        fraction_suffix(frac, dec)
    ))
}

fn decode_time(v: u32) -> String {
    let mut v = ((v << 8) as i32) >> 8;
    if v == 0 {
        return "00:00:00".to_string();
    }
    let sign = if v < 0 { "-" } else { "" };
    v = v.abs();
    format!("{}{:02}:{:02}:{:02}", sign, v / 10_000, (v % 10_000) / 100, v % 100)
}

fn decode_time2(r: &mut ByteReader<'_>, dec: u16) -> Result<String> {
    let (tmp, int_part, frac) = match dec {
        1 | 2 => {
            let mut int_part = r.uint_be(3)? as i64 - TIMEF_INT_OFS;
            let mut frac = i64::from(r.u8()?);
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            ((int_part << 24) + frac * 10_000, int_part, frac)
        }
        3 | 4 => {
            let mut int_part = r.uint_be(3)? as i64 - TIMEF_INT_OFS;
            let mut frac = r.uint_be(2)? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            ((int_part << 24) + frac * 100, int_part, frac)
        }
        5 | 6 => {
            let tmp = r.uint_be(6)? as i64 - TIMEF_OFS;
            return Ok(format_time(tmp, dec));
        }
        _ => {
            let int_part = r.uint_be(3)? as i64 - TIMEF_INT_OFS;
            (int_part << 24, int_part, 0)
        }
    };
    if int_part == 0 && frac == 0 {
        return Ok("00:00:00".to_string());
    }
    Ok(format_time(tmp, dec))
}

fn format_time(tmp: i64, dec: u16) -> String {
    let sign = if tmp < 0 { "-" } else { "" };
    let tmp = tmp.abs();
    let hms = tmp >> 24;
    let hour = (hms >> 12) % (1 << 10);
    let minute = (hms >> 6) % (1 << 6);
    let second = hms % (1 << 6);
    let micros = tmp % (1 << 24);
    if micros != 0 {
        format!(
            "{}{:02}:{:02}:{:02}{}",
            sign,
            hour,
            minute,
            second,
            fraction_suffix(micros, dec)
        )
    } else {
        format!("{}{:02}:{:02}:{:02}", sign, hour, minute, second)
    }
}

const DIGITS_PER_INTEGER: usize = 9;
const COMPRESSED_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

/// Decode a packed DECIMAL(precision, scale) into its text form.
///
/// Digits are stored in groups of nine per 4 bytes with the leftover digits
/// packed into fewer bytes. The sign bit is inverted and negative values
/// have every byte complemented.
fn decode_decimal(r: &mut ByteReader<'_>, precision: usize, scale: usize) -> Result<String> {
    if scale > precision {
        return Err(CanalError::protocol(format!(
            "invalid decimal({}, {})",
            precision, scale
        )));
    }
    let integral = precision - scale;
    let uncomp_integral = integral / DIGITS_PER_INTEGER;
    let uncomp_fractional = scale / DIGITS_PER_INTEGER;
    let comp_integral = integral % DIGITS_PER_INTEGER;
    let comp_fractional = scale % DIGITS_PER_INTEGER;
    let size = uncomp_integral * 4
        + COMPRESSED_BYTES[comp_integral]
        + uncomp_fractional * 4
        + COMPRESSED_BYTES[comp_fractional];

    let mut data = r.bytes(size)?.to_vec();
    if data.is_empty() {
        return Ok("0".to_string());
    }

    let negative = data[0] & 0x80 == 0;
    data[0] ^= 0x80;
    if negative {
        data.iter_mut().for_each(|b| *b = !*b);
    }

    let mut d = ByteReader::new(&data);
    let mut out = String::new();
    if negative {
        out.push('-');
    }

    let mut leading_zero = true;
    let head = d.uint_be(COMPRESSED_BYTES[comp_integral])?;
    if head != 0 {
        leading_zero = false;
        out.push_str(&head.to_string());
    }
    for _ in 0..uncomp_integral {
        let v = d.uint_be(4)?;
        if leading_zero {
            if v != 0 {
                leading_zero = false;
                out.push_str(&v.to_string());
            }
        } else {
            out.push_str(&format!("{:09}", v));
        }
    }
    if leading_zero {
        out.push('0');
    }

    if !d.is_empty() {
        out.push('.');
        for _ in 0..uncomp_fractional {
            out.push_str(&format!("{:09}", d.uint_be(4)?));
        }
        let n = COMPRESSED_BYTES[comp_fractional];
        if n > 0 {
            let v = d.uint_be(n)?;
            out.push_str(&format!("{:0width$}", v, width = comp_fractional));
        }
    }
    Ok(out)
}
