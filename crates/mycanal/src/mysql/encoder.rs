//! Binlog event encoder
//!
//! Builds raw events the way a server writes them, for synthetic binlog
//! files (`mycanal gen-binlog`) and for scripted replication tests.
//! Encoded events carry `log_pos` 0; [`BinlogFileWriter`] and
//! [`set_log_pos`] fill it in once the event's offset is known.

use super::codec::{bitmap_len, put_lenenc_bytes, put_lenenc_int};
use super::event::*;
use super::gtid::MysqlGtidSet;
use crate::common::{CanalError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Post-header lengths written by MySQL 8.0, indexed by `type - 1`
const POST_HEADER_LENGTHS: [u8; 41] = [
    56, 13, 0, 8, 0, 18, 0, 4, 4, 4, 4, 18, 0, 0, 95, 0, 4, 26, 8, 0, 0, 0, 8, 8, 8, 2, 0, 0, 0,
    10, 10, 10, 42, 42, 0, 18, 52, 0, 10, 40, 0,
];

/// Rows event flag marking the last rows event of a statement
pub const ROWS_FLAG_STMT_END: u16 = 0x0001;

/// Builds raw binlog events.
#[derive(Debug, Clone)]
pub struct EventEncoder {
    server_id: u32,
    timestamp: u32,
    checksum: bool,
}

impl EventEncoder {
    pub fn new(server_id: u32) -> Self {
        Self {
            server_id,
            timestamp: 0,
            checksum: true,
        }
    }

    /// Append CRC32 checksums (the server default since 5.6.6).
    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn checksum(&self) -> bool {
        self.checksum
    }

    fn finish(&self, event_type: EventType, flags: u16, body: &[u8]) -> Bytes {
        let checksum_len = if self.checksum { BINLOG_CHECKSUM_LEN } else { 0 };
        let size = EVENT_HEADER_SIZE + body.len() + checksum_len;
        let mut buf = BytesMut::with_capacity(size);
        EventHeader {
            timestamp: self.timestamp,
            event_type,
            server_id: self.server_id,
            event_size: size as u32,
            log_pos: 0,
            flags,
        }
        .encode(&mut buf);
        buf.put_slice(body);
        if self.checksum {
            buf.put_u32_le(crc32fast::hash(&buf));
        }
        buf.freeze()
    }

    /// Format description; always carries the checksum algorithm byte and
    /// four checksum bytes (zero when checksums are off).
    pub fn format_description(&self, server_version: &str) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u16_le(4);
        let mut version = [0u8; 50];
        let n = server_version.len().min(version.len());
        version[..n].copy_from_slice(&server_version.as_bytes()[..n]);
        body.put_slice(&version);
        body.put_u32_le(self.timestamp);
        body.put_u8(EVENT_HEADER_SIZE as u8);
        body.put_slice(&POST_HEADER_LENGTHS);
        body.put_u8(if self.checksum {
            BINLOG_CHECKSUM_ALG_CRC32
        } else {
            BINLOG_CHECKSUM_ALG_OFF
        });

        if self.checksum {
            self.finish(EventType::FormatDescription, 0, &body)
        } else {
            let mut raw = BytesMut::from(&self.finish(EventType::FormatDescription, 0, &body)[..]);
            raw.put_u32_le(0);
            let size = raw.len() as u32;
            raw[9..13].copy_from_slice(&size.to_le_bytes());
            raw.freeze()
        }
    }

    pub fn rotate(&self, next_log_name: &str, position: u64) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u64_le(position);
        body.put_slice(next_log_name.as_bytes());
        self.finish(EventType::Rotate, 0, &body)
    }

    pub fn query(&self, schema: &str, query: &str) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u32_le(1); // thread id
        body.put_u32_le(0); // execution time
        body.put_u8(schema.len() as u8);
        body.put_u16_le(0); // error code
        body.put_u16_le(0); // status vars
        body.put_slice(schema.as_bytes());
        body.put_u8(0);
        body.put_slice(query.as_bytes());
        self.finish(EventType::Query, 0, &body)
    }

    pub fn xid(&self, xid: u64) -> Bytes {
        self.finish(EventType::Xid, 0, &xid.to_le_bytes())
    }

    pub fn gtid(&self, sid: Uuid, gno: i64, last_committed: i64, sequence_number: i64) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u8(1); // commit flag
        body.put_slice(sid.as_bytes());
        body.put_i64_le(gno);
        body.put_u8(2); // logical timestamp
        body.put_i64_le(last_committed);
        body.put_i64_le(sequence_number);
        self.finish(EventType::Gtid, 0, &body)
    }

    pub fn previous_gtids(&self, set: &MysqlGtidSet) -> Bytes {
        self.finish(EventType::PreviousGtids, 0, &set.encode())
    }

    pub fn heartbeat(&self, log_name: &str) -> Bytes {
        self.finish(EventType::Heartbeat, 0, log_name.as_bytes())
    }

    pub fn table_map(&self, table: &TableMapEvent) -> Result<Bytes> {
        let mut body = BytesMut::new();
        body.put_uint_le(table.table_id, 6);
        body.put_u16_le(table.flags);
        body.put_u8(table.schema.len() as u8);
        body.put_slice(table.schema.as_bytes());
        body.put_u8(0);
        body.put_u8(table.table.len() as u8);
        body.put_slice(table.table.as_bytes());
        body.put_u8(0);
        put_lenenc_int(&mut body, table.column_types.len() as u64);
        body.put_slice(&table.column_types);

        let mut meta = BytesMut::new();
        for (i, &t) in table.column_types.iter().enumerate() {
            let m = table.column_meta.get(i).copied().unwrap_or(0);
            match column_type(t)? {
                ColumnType::String | ColumnType::NewDecimal => meta.put_u16(m),
                ColumnType::VarString | ColumnType::VarChar | ColumnType::Bit => meta.put_u16_le(m),
                ColumnType::Blob
                | ColumnType::Double
                | ColumnType::Float
                | ColumnType::Geometry
                | ColumnType::Json
                | ColumnType::Time2
                | ColumnType::DateTime2
                | ColumnType::Timestamp2 => meta.put_u8(m as u8),
                _ => {}
            }
        }
        put_lenenc_bytes(&mut body, &meta);

        let mut null_bitmap = table.null_bitmap.clone();
        null_bitmap.resize(bitmap_len(table.column_types.len()), 0);
        body.put_slice(&null_bitmap);

        if let Some(signedness) = &table.signedness_bitmap {
            body.put_u8(1);
            put_lenenc_bytes(&mut body, signedness);
        }
        if !table.column_names.is_empty() {
            let mut names = BytesMut::new();
            for name in &table.column_names {
                put_lenenc_bytes(&mut names, name.as_bytes());
            }
            body.put_u8(4);
            put_lenenc_bytes(&mut body, &names);
        }
        if !table.primary_key.is_empty() {
            let mut keys = BytesMut::new();
            for &k in &table.primary_key {
                put_lenenc_int(&mut keys, k);
            }
            body.put_u8(8);
            put_lenenc_bytes(&mut body, &keys);
        }

        Ok(self.finish(EventType::TableMap, 0, &body))
    }

    /// Rows event of layout `version` (1 or 2) with every column present.
    /// Update rows alternate before and after images.
    pub fn rows(
        &self,
        version: u8,
        action: RowsAction,
        table: &TableMapEvent,
        rows: &[Vec<RowValue>],
    ) -> Result<Bytes> {
        if !(1..=2).contains(&version) {
            return Err(CanalError::UnsupportedRowsVersion(version));
        }
        if action == RowsAction::Update && rows.len() % 2 != 0 {
            return Err(CanalError::invariant("update rows must come in pairs"));
        }

        let column_count = table.column_types.len();
        let mut body = BytesMut::new();
        body.put_uint_le(table.table_id, 6);
        body.put_u16_le(ROWS_FLAG_STMT_END);
        if version == 2 {
            body.put_u16_le(2);
        }
        put_lenenc_int(&mut body, column_count as u64);

        let present = all_present(column_count);
        body.put_slice(&present);
        if action == RowsAction::Update {
            body.put_slice(&present);
        }

        for row in rows {
            if row.len() != column_count {
                return Err(CanalError::invariant(format!(
                    "row has {} values, table has {} columns",
                    row.len(),
                    column_count
                )));
            }
            let mut nulls = vec![0u8; bitmap_len(column_count)];
            for (i, v) in row.iter().enumerate() {
                if v.is_null() {
                    nulls[i / 8] |= 1 << (i % 8);
                }
            }
            body.put_slice(&nulls);
            for (i, v) in row.iter().enumerate() {
                if !v.is_null() {
                    let meta = table.column_meta.get(i).copied().unwrap_or(0);
                    encode_value(&mut body, table.column_types[i], meta, v)?;
                }
            }
        }

        Ok(self.finish(EventType::rows_event(version, action), 0, &body))
    }
}

fn all_present(columns: usize) -> Vec<u8> {
    let mut bitmap = vec![0u8; bitmap_len(columns)];
    for i in 0..columns {
        bitmap[i / 8] |= 1 << (i % 8);
    }
    bitmap
}

fn column_type(t: u8) -> Result<ColumnType> {
    ColumnType::from_u8(t).ok_or_else(|| CanalError::protocol(format!("unknown column type {}", t)))
}

/// Patch the `log_pos` header field, refreshing the checksum when present.
pub fn set_log_pos(raw: &mut [u8], log_pos: u32, checksum: bool) {
    raw[13..17].copy_from_slice(&log_pos.to_le_bytes());
    if checksum && raw.len() >= EVENT_HEADER_SIZE + BINLOG_CHECKSUM_LEN {
        let split = raw.len() - BINLOG_CHECKSUM_LEN;
        let crc = crc32fast::hash(&raw[..split]);
        raw[split..].copy_from_slice(&crc.to_le_bytes());
    }
}

// ============================================================================
// Values
// ============================================================================

fn mismatch(value: &RowValue, column_type: ColumnType) -> CanalError {
    CanalError::protocol(format!("cannot encode {:?} as {:?}", value, column_type))
}

fn as_i64(value: &RowValue) -> Option<i64> {
    Some(match value {
        RowValue::Int8(v) => i64::from(*v),
        RowValue::Int16(v) => i64::from(*v),
        RowValue::Int32(v) => i64::from(*v),
        RowValue::Int64(v) => *v,
        RowValue::UInt8(v) => i64::from(*v),
        RowValue::UInt16(v) => i64::from(*v),
        RowValue::UInt32(v) => i64::from(*v),
        RowValue::UInt64(v) => *v as i64,
        RowValue::Year(v) => i64::from(*v),
        RowValue::Enum(v) => *v,
        RowValue::Set(v) | RowValue::Bit(v) => *v as i64,
        _ => return None,
    })
}

fn as_bytes(value: &RowValue) -> Option<&[u8]> {
    match value {
        RowValue::String(s)
        | RowValue::Decimal(s)
        | RowValue::Date(s)
        | RowValue::Time(s)
        | RowValue::DateTime(s)
        | RowValue::Timestamp(s) => Some(s.as_bytes()),
        RowValue::Bytes(b) => Some(b),
        _ => None,
    }
}

fn as_text(value: &RowValue) -> Option<&str> {
    as_bytes(value).and_then(|b| std::str::from_utf8(b).ok())
}

fn encode_value(buf: &mut BytesMut, t: u8, meta: u16, value: &RowValue) -> Result<()> {
    let mut ct = column_type(t)?;
    let mut length = usize::from(meta);
    if ct == ColumnType::String && meta >= 256 {
        let b0 = (meta >> 8) as u8;
        let b1 = (meta & 0xFF) as u8;
        if b0 & 0x30 != 0x30 {
            length = usize::from(b1) | (usize::from((b0 & 0x30) ^ 0x30) << 4);
            ct = column_type(b0 | 0x30)?;
        } else {
            length = usize::from(b1);
            ct = column_type(b0)?;
        }
    }
    let int = || as_i64(value).ok_or_else(|| mismatch(value, ct));
    let text = || as_text(value).ok_or_else(|| mismatch(value, ct));

    match ct {
        ColumnType::Null => {}
        ColumnType::Tiny => buf.put_i8(int()? as i8),
        ColumnType::Short => buf.put_i16_le(int()? as i16),
        ColumnType::Int24 => buf.put_uint_le((int()? as u64) & 0xFF_FFFF, 3),
        ColumnType::Long => buf.put_i32_le(int()? as i32),
        ColumnType::LongLong => buf.put_i64_le(int()?),
        ColumnType::Float => match value {
            RowValue::Float(v) => buf.put_f32_le(*v),
            RowValue::Double(v) => buf.put_f32_le(*v as f32),
            _ => return Err(mismatch(value, ct)),
        },
        ColumnType::Double => match value {
            RowValue::Double(v) => buf.put_f64_le(*v),
            RowValue::Float(v) => buf.put_f64_le(f64::from(*v)),
            _ => return Err(mismatch(value, ct)),
        },
        ColumnType::NewDecimal => {
            encode_decimal(buf, text()?, usize::from(meta >> 8), usize::from(meta & 0xFF))?
        }
        ColumnType::Bit => {
            let nbits = usize::from(meta >> 8) * 8 + usize::from(meta & 0xFF);
            buf.put_uint(int()? as u64, nbits.div_ceil(8));
        }
        ColumnType::Year => {
            let y = int()?;
            buf.put_u8(if y == 0 { 0 } else { (y - 1900) as u8 });
        }
        ColumnType::Date => {
            let (p, _) = split_temporal(text()?)?;
            buf.put_uint_le(((p[0] << 9) | (p[1] << 5) | p[2]) as u64, 3);
        }
        ColumnType::DateTime => {
            let (p, _) = split_temporal(text()?)?;
            let v = p[0] * 10_000_000_000
                + p[1] * 100_000_000
                + p[2] * 1_000_000
                + p[3] * 10_000
                + p[4] * 100
                + p[5];
            buf.put_u64_le(v as u64);
        }
        ColumnType::DateTime2 => {
            let (p, micros) = split_temporal(text()?)?;
            let ymd = ((p[0] * 13 + p[1]) << 5) | p[2];
            let hms = (p[3] << 12) | (p[4] << 6) | p[5];
            let packed = if p.iter().all(|v| *v == 0) {
                0
            } else {
                (ymd << 17) | hms
            };
            buf.put_uint((packed + 0x80_0000_0000) as u64, 5);
            put_fraction(buf, micros, meta);
        }
        ColumnType::Timestamp | ColumnType::Timestamp2 => {
            let (p, micros) = split_temporal(text()?)?;
            let secs = if p.iter().all(|v| *v == 0) {
                0
            } else {
                chrono::NaiveDate::from_ymd_opt(p[0] as i32, p[1] as u32, p[2] as u32)
                    .and_then(|d| d.and_hms_opt(p[3] as u32, p[4] as u32, p[5] as u32))
                    .map(|t| t.and_utc().timestamp())
                    .ok_or_else(|| mismatch(value, ct))?
            };
            if ct == ColumnType::Timestamp {
                buf.put_u32_le(secs as u32);
            } else {
                buf.put_u32(secs as u32);
                put_fraction(buf, micros, meta);
            }
        }
        ColumnType::Time => {
            let (negative, h, m, s, _) = split_time(text()?)?;
            let v = h * 10_000 + m * 100 + s;
            let v = if negative { -v } else { v };
            buf.put_uint_le((v as u64) & 0xFF_FFFF, 3);
        }
        ColumnType::Time2 => {
            let (negative, h, m, s, micros) = split_time(text()?)?;
            let mut tmp = (((h << 12) | (m << 6) | s) << 24) + micros;
            if negative {
                tmp = -tmp;
            }
            let int_part = tmp >> 24;
            let frac = tmp % (1 << 24);
            match meta {
                1 | 2 => {
                    buf.put_uint((int_part + 0x80_0000) as u64, 3);
                    buf.put_u8((frac / 10_000) as i8 as u8);
                }
                3 | 4 => {
                    buf.put_uint((int_part + 0x80_0000) as u64, 3);
                    buf.put_u16((frac / 100) as i16 as u16);
                }
                5 | 6 => buf.put_uint((tmp + 0x8000_0000_0000) as u64, 6),
                _ => buf.put_uint((int_part + 0x80_0000) as u64, 3),
            }
        }
        ColumnType::Enum => buf.put_uint_le(int()? as u64, usize::from(meta & 0xFF)),
        ColumnType::Set => buf.put_uint_le(int()? as u64, usize::from(meta & 0xFF)),
        ColumnType::Blob | ColumnType::Geometry => {
            let data = as_bytes(value).ok_or_else(|| mismatch(value, ct))?;
            buf.put_uint_le(data.len() as u64, usize::from(meta));
            buf.put_slice(data);
        }
        ColumnType::Json => {
            let text = match value {
                RowValue::Json(v) => v.to_string(),
                other => as_text(other).ok_or_else(|| mismatch(value, ct))?.to_string(),
            };
            buf.put_uint_le(text.len() as u64, usize::from(meta));
            buf.put_slice(text.as_bytes());
        }
        ColumnType::VarChar | ColumnType::VarString | ColumnType::String => {
            let data = as_bytes(value).ok_or_else(|| mismatch(value, ct))?;
            if length < 256 {
                buf.put_u8(data.len() as u8);
            } else {
                buf.put_u16_le(data.len() as u16);
            }
            buf.put_slice(data);
        }
        other => return Err(mismatch(value, other)),
    }
    Ok(())
}

fn put_fraction(buf: &mut BytesMut, micros: i64, dec: u16) {
    match dec {
        1 | 2 => buf.put_u8((micros / 10_000) as u8),
        3 | 4 => buf.put_u16((micros / 100) as u16),
        5 | 6 => buf.put_uint(micros as u64, 3),
        _ => {}
    }
}

fn parse_micros(frac: &str) -> i64 {
    let digits: String = frac.chars().take(6).collect();
    format!("{:0<6}", digits).parse().unwrap_or(0)
}

/// `YYYY-MM-DD[ HH:MM:SS[.ffffff]]` into six fields plus microseconds.
fn split_temporal(s: &str) -> Result<([i64; 6], i64)> {
    let invalid = || CanalError::protocol(format!("invalid temporal value '{}'", s));
    let (main, frac) = s.split_once('.').unwrap_or((s, ""));
    let mut out = [0i64; 6];
    let mut n = 0;
    for part in main.split(['-', ' ', ':']) {
        if n >= out.len() {
            return Err(invalid());
        }
        out[n] = part.parse().map_err(|_| invalid())?;
        n += 1;
    }
    if n != 3 && n != 6 {
        return Err(invalid());
    }
    Ok((out, parse_micros(frac)))
}

/// `[-]HH:MM:SS[.ffffff]`
fn split_time(s: &str) -> Result<(bool, i64, i64, i64, i64)> {
    let invalid = || CanalError::protocol(format!("invalid time value '{}'", s));
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (main, frac) = rest.split_once('.').unwrap_or((rest, ""));
    let mut parts = main.split(':').map(|p| p.parse::<i64>().map_err(|_| invalid()));
    let h = parts.next().ok_or_else(invalid)??;
    let m = parts.next().ok_or_else(invalid)??;
    let sec = parts.next().ok_or_else(invalid)??;
    Ok((negative, h, m, sec, parse_micros(frac)))
}

const COMPRESSED_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

fn encode_decimal(buf: &mut BytesMut, text: &str, precision: usize, scale: usize) -> Result<()> {
    let invalid = || CanalError::protocol(format!("invalid decimal({}, {}) value '{}'", precision, scale, text));
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (int_digits, frac_digits) = digits.split_once('.').unwrap_or((digits, ""));
    if !int_digits.chars().chain(frac_digits.chars()).all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let integral = precision.checked_sub(scale).ok_or_else(invalid)?;
    let int_digits = int_digits.trim_start_matches('0');
    if int_digits.len() > integral {
        return Err(invalid());
    }
    let int_digits = format!("{:0>width$}", int_digits, width = integral);
    let mut frac_digits: String = frac_digits.chars().take(scale).collect();
    while frac_digits.len() < scale {
        frac_digits.push('0');
    }

    let mut out = BytesMut::new();
    let group = |out: &mut BytesMut, digits: &str, bytes: usize| -> Result<()> {
        let v: u64 = if digits.is_empty() { 0 } else { digits.parse().map_err(|_| invalid())? };
        out.put_uint(v, bytes);
        Ok(())
    };

    let lead = integral % 9;
    group(&mut out, &int_digits[..lead], COMPRESSED_BYTES[lead])?;
    for chunk in int_digits.as_bytes()[lead..].chunks(9) {
        group(&mut out, std::str::from_utf8(chunk).map_err(|_| invalid())?, 4)?;
    }
    let full = scale / 9 * 9;
    for chunk in frac_digits.as_bytes()[..full].chunks(9) {
        group(&mut out, std::str::from_utf8(chunk).map_err(|_| invalid())?, 4)?;
    }
    group(&mut out, &frac_digits[full..], COMPRESSED_BYTES[scale % 9])?;

    if let Some(first) = out.first_mut() {
        *first ^= 0x80;
    }
    if negative {
        out.iter_mut().for_each(|b| *b = !*b);
    }
    buf.put_slice(&out);
    Ok(())
}

// ============================================================================
// Binlog files
// ============================================================================

/// Writes a binlog file: the magic header, then events with their
/// `log_pos` set to the offset following each event.
pub struct BinlogFileWriter<W> {
    inner: W,
    position: u32,
    checksum: bool,
}

impl BinlogFileWriter<tokio::io::BufWriter<tokio::fs::File>> {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        Self::new(tokio::io::BufWriter::new(file)).await
    }
}

impl<W: AsyncWrite + Unpin> BinlogFileWriter<W> {
    pub async fn new(mut inner: W) -> Result<Self> {
        inner.write_all(&BINLOG_FILE_HEADER).await?;
        Ok(Self {
            inner,
            position: BINLOG_FILE_HEADER.len() as u32,
            checksum: false,
        })
    }

    /// Offset at which the next event will be written
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Append one event and return its `log_pos`.
    pub async fn append(&mut self, event: &[u8]) -> Result<u32> {
        let header = EventHeader::parse(event)?;
        if header.event_type == EventType::FormatDescription && event.len() >= 5 {
            // the algorithm byte sits before the 4 checksum bytes
            self.checksum = event[event.len() - 5] == BINLOG_CHECKSUM_ALG_CRC32;
        }

        let log_pos = self.position + event.len() as u32;
        let mut raw = event.to_vec();
        set_log_pos(&mut raw, log_pos, self.checksum);
        self.inner.write_all(&raw).await?;
        self.position = log_pos;
        Ok(log_pos)
    }

    pub async fn finish(mut self) -> Result<W> {
        self.inner.flush().await?;
        Ok(self.inner)
    }
}
