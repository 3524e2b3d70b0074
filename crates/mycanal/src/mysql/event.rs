//! Binlog event model
//!
//! A decoded event is a common 19 byte header plus a typed body. Row events
//! keep a shared reference to the table map they were decoded against so the
//! column types and metadata travel with the rows.

use super::codec::ByteReader;
use super::gtid::{GtidSet, MariadbGtid, MysqlGtidSet};
use crate::common::Result;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Common event header size
pub const EVENT_HEADER_SIZE: usize = 19;
/// Magic bytes at the start of every binlog file
pub const BINLOG_FILE_HEADER: [u8; 4] = [0xfe, b'b', b'i', b'n'];
/// Trailing CRC32 checksum size
pub const BINLOG_CHECKSUM_LEN: usize = 4;
/// Events with this header flag may be skipped by readers that do not know them
pub const LOG_EVENT_IGNORABLE_F: u16 = 0x80;
/// Checksum algorithm codes from the format description event
pub const BINLOG_CHECKSUM_ALG_OFF: u8 = 0;
pub const BINLOG_CHECKSUM_ALG_CRC32: u8 = 1;
pub const BINLOG_CHECKSUM_ALG_UNDEF: u8 = 255;

/// Binlog event type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Unknown,
    StartV3,
    Query,
    Stop,
    Rotate,
    Intvar,
    Load,
    Slave,
    CreateFile,
    AppendBlock,
    ExecLoad,
    DeleteFile,
    NewLoad,
    Rand,
    UserVar,
    FormatDescription,
    Xid,
    BeginLoadQuery,
    ExecuteLoadQuery,
    TableMap,
    WriteRowsV0,
    UpdateRowsV0,
    DeleteRowsV0,
    WriteRowsV1,
    UpdateRowsV1,
    DeleteRowsV1,
    Incident,
    Heartbeat,
    Ignorable,
    RowsQuery,
    WriteRowsV2,
    UpdateRowsV2,
    DeleteRowsV2,
    Gtid,
    AnonymousGtid,
    PreviousGtids,
    TransactionContext,
    ViewChange,
    XaPrepare,
    PartialUpdateRows,
    TransactionPayload,
    HeartbeatV2,
    GtidTagged,
    MariadbAnnotateRows,
    MariadbBinlogCheckpoint,
    MariadbGtid,
    MariadbGtidList,
    MariadbStartEncryption,
    MariadbQueryCompressed,
    MariadbWriteRowsCompressedV1,
    MariadbUpdateRowsCompressedV1,
    MariadbDeleteRowsCompressedV1,
    /// Type code this library does not know
    Other(u8),
}

impl EventType {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => Self::Unknown,
            1 => Self::StartV3,
            2 => Self::Query,
            3 => Self::Stop,
            4 => Self::Rotate,
            5 => Self::Intvar,
            6 => Self::Load,
            7 => Self::Slave,
            8 => Self::CreateFile,
            9 => Self::AppendBlock,
            10 => Self::ExecLoad,
            11 => Self::DeleteFile,
            12 => Self::NewLoad,
            13 => Self::Rand,
            14 => Self::UserVar,
            15 => Self::FormatDescription,
            16 => Self::Xid,
            17 => Self::BeginLoadQuery,
            18 => Self::ExecuteLoadQuery,
            19 => Self::TableMap,
            20 => Self::WriteRowsV0,
            21 => Self::UpdateRowsV0,
            22 => Self::DeleteRowsV0,
            23 => Self::WriteRowsV1,
            24 => Self::UpdateRowsV1,
            25 => Self::DeleteRowsV1,
            26 => Self::Incident,
            27 => Self::Heartbeat,
            28 => Self::Ignorable,
            29 => Self::RowsQuery,
            30 => Self::WriteRowsV2,
            31 => Self::UpdateRowsV2,
            32 => Self::DeleteRowsV2,
            33 => Self::Gtid,
            34 => Self::AnonymousGtid,
            35 => Self::PreviousGtids,
            36 => Self::TransactionContext,
            37 => Self::ViewChange,
            38 => Self::XaPrepare,
            39 => Self::PartialUpdateRows,
            40 => Self::TransactionPayload,
            41 => Self::HeartbeatV2,
            42 => Self::GtidTagged,
            160 => Self::MariadbAnnotateRows,
            161 => Self::MariadbBinlogCheckpoint,
            162 => Self::MariadbGtid,
            163 => Self::MariadbGtidList,
            164 => Self::MariadbStartEncryption,
            165 => Self::MariadbQueryCompressed,
            169 => Self::MariadbWriteRowsCompressedV1,
            170 => Self::MariadbUpdateRowsCompressedV1,
            171 => Self::MariadbDeleteRowsCompressedV1,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::StartV3 => 1,
            Self::Query => 2,
            Self::Stop => 3,
            Self::Rotate => 4,
            Self::Intvar => 5,
            Self::Load => 6,
            Self::Slave => 7,
            Self::CreateFile => 8,
            Self::AppendBlock => 9,
            Self::ExecLoad => 10,
            Self::DeleteFile => 11,
            Self::NewLoad => 12,
            Self::Rand => 13,
            Self::UserVar => 14,
            Self::FormatDescription => 15,
            Self::Xid => 16,
            Self::BeginLoadQuery => 17,
            Self::ExecuteLoadQuery => 18,
            Self::TableMap => 19,
            Self::WriteRowsV0 => 20,
            Self::UpdateRowsV0 => 21,
            Self::DeleteRowsV0 => 22,
            Self::WriteRowsV1 => 23,
            Self::UpdateRowsV1 => 24,
            Self::DeleteRowsV1 => 25,
            Self::Incident => 26,
            Self::Heartbeat => 27,
            Self::Ignorable => 28,
            Self::RowsQuery => 29,
            Self::WriteRowsV2 => 30,
            Self::UpdateRowsV2 => 31,
            Self::DeleteRowsV2 => 32,
            Self::Gtid => 33,
            Self::AnonymousGtid => 34,
            Self::PreviousGtids => 35,
            Self::TransactionContext => 36,
            Self::ViewChange => 37,
            Self::XaPrepare => 38,
            Self::PartialUpdateRows => 39,
            Self::TransactionPayload => 40,
            Self::HeartbeatV2 => 41,
            Self::GtidTagged => 42,
            Self::MariadbAnnotateRows => 160,
            Self::MariadbBinlogCheckpoint => 161,
            Self::MariadbGtid => 162,
            Self::MariadbGtidList => 163,
            Self::MariadbStartEncryption => 164,
            Self::MariadbQueryCompressed => 165,
            Self::MariadbWriteRowsCompressedV1 => 169,
            Self::MariadbUpdateRowsCompressedV1 => 170,
            Self::MariadbDeleteRowsCompressedV1 => 171,
            Self::Other(code) => *code,
        }
    }

    /// Rows event layout version and action, if this is a rows event.
    pub fn rows_kind(&self) -> Option<(u8, RowsAction)> {
        match self {
            Self::WriteRowsV0 => Some((0, RowsAction::Insert)),
            Self::UpdateRowsV0 => Some((0, RowsAction::Update)),
            Self::DeleteRowsV0 => Some((0, RowsAction::Delete)),
            Self::WriteRowsV1 => Some((1, RowsAction::Insert)),
            Self::UpdateRowsV1 => Some((1, RowsAction::Update)),
            Self::DeleteRowsV1 => Some((1, RowsAction::Delete)),
            Self::WriteRowsV2 => Some((2, RowsAction::Insert)),
            Self::UpdateRowsV2 => Some((2, RowsAction::Update)),
            Self::DeleteRowsV2 => Some((2, RowsAction::Delete)),
            _ => None,
        }
    }

    /// Rows event type code for a layout version and action.
    pub fn rows_event(version: u8, action: RowsAction) -> Self {
        let base = match version {
            0 => 20,
            1 => 23,
            _ => 30,
        };
        let offset = match action {
            RowsAction::Insert => 0,
            RowsAction::Update => 1,
            RowsAction::Delete => 2,
        };
        Self::from_u8(base + offset)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "UnknownEvent({})", code),
            other => write!(f, "{:?}Event", other),
        }
    }
}

/// Row change action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowsAction {
    Insert,
    Update,
    Delete,
}

impl RowsAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowsAction::Insert => "insert",
            RowsAction::Update => "update",
            RowsAction::Delete => "delete",
        }
    }
}

impl fmt::Display for RowsAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MySQL column type codes as used in table map events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    VarChar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    TypedArray = 20,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Decimal,
            1 => Self::Tiny,
            2 => Self::Short,
            3 => Self::Long,
            4 => Self::Float,
            5 => Self::Double,
            6 => Self::Null,
            7 => Self::Timestamp,
            8 => Self::LongLong,
            9 => Self::Int24,
            10 => Self::Date,
            11 => Self::Time,
            12 => Self::DateTime,
            13 => Self::Year,
            14 => Self::NewDate,
            15 => Self::VarChar,
            16 => Self::Bit,
            17 => Self::Timestamp2,
            18 => Self::DateTime2,
            19 => Self::Time2,
            20 => Self::TypedArray,
            245 => Self::Json,
            246 => Self::NewDecimal,
            247 => Self::Enum,
            248 => Self::Set,
            249 => Self::TinyBlob,
            250 => Self::MediumBlob,
            251 => Self::LongBlob,
            252 => Self::Blob,
            253 => Self::VarString,
            254 => Self::String,
            255 => Self::Geometry,
            _ => return None,
        })
    }

    /// Numeric types covered by the optional signedness bitmap.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Tiny
                | Self::Short
                | Self::Int24
                | Self::Long
                | Self::LongLong
                | Self::NewDecimal
                | Self::Float
                | Self::Double
        )
    }
}

/// Common 19 byte event header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    pub event_size: u32,
    /// Position of the next event in the binlog file
    pub log_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        Ok(Self {
            timestamp: r.u32_le()?,
            event_type: EventType::from_u8(r.u8()?),
            server_id: r.u32_le()?,
            event_size: r.u32_le()?,
            log_pos: r.u32_le()?,
            flags: r.u16_le()?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.timestamp);
        buf.put_u8(self.event_type.code());
        buf.put_u32_le(self.server_id);
        buf.put_u32_le(self.event_size);
        buf.put_u32_le(self.log_pos);
        buf.put_u16_le(self.flags);
    }

    pub fn is_ignorable(&self) -> bool {
        self.flags & LOG_EVENT_IGNORABLE_F != 0
    }
}

/// Format description event (type 15)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub event_header_length: u8,
    /// Post-header length per event type, indexed by `type - 1`
    pub event_type_header_lengths: Vec<u8>,
    pub checksum_algorithm: u8,
}

impl FormatDescriptionEvent {
    pub fn post_header_len(&self, event_type: EventType) -> Option<u8> {
        let idx = usize::from(event_type.code()).checked_sub(1)?;
        self.event_type_header_lengths.get(idx).copied()
    }

    pub fn has_crc32(&self) -> bool {
        self.checksum_algorithm == BINLOG_CHECKSUM_ALG_CRC32
    }

    /// Table id width used by table map and rows events.
    pub fn table_id_size(&self, event_type: EventType) -> usize {
        if self.post_header_len(event_type) == Some(6) {
            4
        } else {
            6
        }
    }
}

/// Rotate event (type 4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateEvent {
    pub position: u64,
    pub next_log_name: String,
}

/// Query event (type 2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEvent {
    pub slave_proxy_id: u32,
    pub execution_time: u32,
    pub error_code: u16,
    pub status_vars: Bytes,
    pub schema: String,
    pub query: String,
    /// GTID set after this statement, filled in by the replication session
    pub gtid_set: Option<GtidSet>,
}

/// XID event (type 16)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XidEvent {
    pub xid: u64,
    /// GTID set after this commit, filled in by the replication session
    pub gtid_set: Option<GtidSet>,
}

/// Table map event (type 19)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub flags: u16,
    pub schema: String,
    pub table: String,
    pub column_count: u64,
    pub column_types: Vec<u8>,
    pub column_meta: Vec<u16>,
    pub null_bitmap: Vec<u8>,
    /// One bit per numeric column, most significant bit first
    pub signedness_bitmap: Option<Vec<u8>>,
    pub column_names: Vec<String>,
    pub primary_key: Vec<u64>,
}

impl TableMapEvent {
    pub fn is_nullable(&self, column: usize) -> bool {
        super::codec::bit_is_set(&self.null_bitmap, column)
    }

    /// Unsigned flag per column index when the server sent signedness
    /// metadata. Only numeric columns appear in the result.
    pub fn unsigned_columns(&self) -> Option<Vec<(usize, bool)>> {
        let bitmap = self.signedness_bitmap.as_ref()?;
        let mut out = Vec::new();
        let mut numeric = 0usize;
        for (i, t) in self.column_types.iter().enumerate() {
            let is_numeric = ColumnType::from_u8(*t)
                .map(|c| c.is_numeric())
                .unwrap_or(false);
            if !is_numeric {
                continue;
            }
            let byte = bitmap.get(numeric / 8).copied().unwrap_or(0);
            out.push((i, byte & (0x80 >> (numeric % 8)) != 0));
            numeric += 1;
        }
        Some(out)
    }
}

/// Rows event (types 20-25, 30-32)
#[derive(Debug, Clone, PartialEq)]
pub struct BinlogRowsEvent {
    pub version: u8,
    pub action: RowsAction,
    pub table_id: u64,
    pub flags: u16,
    pub extra_data: Bytes,
    pub column_count: u64,
    pub columns_present: Vec<u8>,
    /// After-image bitmap of update events
    pub columns_present_after: Vec<u8>,
    pub table: Arc<TableMapEvent>,
    /// Decoded rows; updates alternate before and after images
    pub rows: Vec<Vec<RowValue>>,
}

/// GTID (33) or anonymous GTID (34) event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidEvent {
    pub commit_flag: u8,
    pub sid: Uuid,
    pub gno: i64,
    pub last_committed: Option<i64>,
    pub sequence_number: Option<i64>,
    /// Tagged GTIDs carry a tag; this wire format never does
    pub tag: Option<String>,
    pub anonymous: bool,
}

impl GtidEvent {
    /// Text form `uuid:gno`.
    pub fn gtid(&self) -> String {
        format!("{}:{}", self.sid, self.gno)
    }
}

/// Previous GTIDs event (type 35)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousGtidsEvent {
    pub gtid_set: MysqlGtidSet,
}

/// Heartbeat event (types 27 and 41)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatEvent {
    pub log_name: String,
}

/// Rows query (29) or MariaDB annotate rows (160) event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowsQueryEvent {
    pub query: String,
}

/// MariaDB GTID event (type 162)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MariadbGtidEvent {
    pub gtid: MariadbGtid,
    pub flags: u8,
}

impl MariadbGtidEvent {
    pub const FL_STANDALONE: u8 = 1;

    /// A standalone event group is a single statement without a commit.
    pub fn is_standalone(&self) -> bool {
        self.flags & Self::FL_STANDALONE != 0
    }
}

/// MariaDB GTID list event (type 163)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MariadbGtidListEvent {
    pub gtids: Vec<MariadbGtid>,
}

/// Typed event body
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    FormatDescription(FormatDescriptionEvent),
    Rotate(RotateEvent),
    Query(QueryEvent),
    TableMap(Arc<TableMapEvent>),
    Rows(BinlogRowsEvent),
    Xid(XidEvent),
    Gtid(GtidEvent),
    PreviousGtids(PreviousGtidsEvent),
    Heartbeat(HeartbeatEvent),
    RowsQuery(RowsQueryEvent),
    MariadbGtid(MariadbGtidEvent),
    MariadbGtidList(MariadbGtidListEvent),
    /// Known but uninterpreted event, body kept raw
    Generic(Bytes),
}

/// A decoded binlog event
#[derive(Debug, Clone, PartialEq)]
pub struct BinlogEvent {
    pub header: EventHeader,
    pub event: EventData,
    /// Complete raw event (header, body and checksum)
    pub raw: Bytes,
}

impl BinlogEvent {
    pub fn event_type(&self) -> EventType {
        self.header.event_type
    }
}

/// A decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    /// Exact decimal in text form
    Decimal(String),
    String(String),
    Bytes(Bytes),
    /// `YYYY-MM-DD`
    Date(String),
    /// `[-]HH:MM:SS[.ffffff]`
    Time(String),
    /// `YYYY-MM-DD HH:MM:SS[.ffffff]`
    DateTime(String),
    /// Timestamps are rendered in UTC like datetimes
    Timestamp(String),
    Year(u16),
    /// 1-based enum index
    Enum(i64),
    /// Set membership bitmap
    Set(u64),
    Bit(u64),
    Json(Value),
}

impl RowValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RowValue::Null)
    }

    /// JSON rendering used by the CLI and handlers that log rows.
    pub fn to_json(&self) -> Value {
        match self {
            RowValue::Null => Value::Null,
            RowValue::Int8(v) => Value::from(*v),
            RowValue::Int16(v) => Value::from(*v),
            RowValue::Int32(v) => Value::from(*v),
            RowValue::Int64(v) => Value::from(*v),
            RowValue::UInt8(v) => Value::from(*v),
            RowValue::UInt16(v) => Value::from(*v),
            RowValue::UInt32(v) => Value::from(*v),
            RowValue::UInt64(v) => Value::from(*v),
            RowValue::Float(v) => Value::from(f64::from(*v)),
            RowValue::Double(v) => Value::from(*v),
            RowValue::Decimal(s)
            | RowValue::String(s)
            | RowValue::Date(s)
            | RowValue::Time(s)
            | RowValue::DateTime(s)
            | RowValue::Timestamp(s) => Value::String(s.clone()),
            RowValue::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => Value::String(s.to_string()),
                Err(_) => Value::String(hex::encode(b)),
            },
            RowValue::Year(v) => Value::from(*v),
            RowValue::Enum(v) => Value::from(*v),
            RowValue::Set(v) | RowValue::Bit(v) => Value::from(*v),
            RowValue::Json(v) => v.clone(),
        }
    }
}

impl fmt::Display for RowValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowValue::Null => f.write_str("NULL"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_codes_round_trip() {
        for code in 0..=255u8 {
            assert_eq!(EventType::from_u8(code).code(), code);
        }
        assert_eq!(EventType::from_u8(162), EventType::MariadbGtid);
        assert_eq!(EventType::from_u8(99), EventType::Other(99));
    }

    #[test]
    fn test_rows_kind() {
        assert_eq!(
            EventType::UpdateRowsV2.rows_kind(),
            Some((2, RowsAction::Update))
        );
        assert_eq!(EventType::Query.rows_kind(), None);
        assert_eq!(
            EventType::rows_event(1, RowsAction::Delete),
            EventType::DeleteRowsV1
        );
        assert_eq!(
            EventType::rows_event(2, RowsAction::Insert),
            EventType::WriteRowsV2
        );
    }

    #[test]
    fn test_header_round_trip() {
        let header = EventHeader {
            timestamp: 1_700_000_000,
            event_type: EventType::Xid,
            server_id: 7,
            event_size: 31,
            log_pos: 1234,
            flags: LOG_EVENT_IGNORABLE_F,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), EVENT_HEADER_SIZE);
        let parsed = EventHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_ignorable());
        assert!(EventHeader::parse(&buf[..10]).is_err());
    }

    #[test]
    fn test_table_id_size() {
        let mut lengths = vec![0u8; 40];
        lengths[usize::from(EventType::TableMap.code()) - 1] = 8;
        lengths[usize::from(EventType::WriteRowsV1.code()) - 1] = 6;
        let fde = FormatDescriptionEvent {
            binlog_version: 4,
            server_version: "5.5.0".into(),
            create_timestamp: 0,
            event_header_length: 19,
            event_type_header_lengths: lengths,
            checksum_algorithm: BINLOG_CHECKSUM_ALG_OFF,
        };
        assert_eq!(fde.table_id_size(EventType::TableMap), 6);
        assert_eq!(fde.table_id_size(EventType::WriteRowsV1), 4);
        assert!(!fde.has_crc32());
    }

    #[test]
    fn test_unsigned_columns_follow_numeric_order() {
        // int, varchar, bigint, tinyint
        let table = TableMapEvent {
            table_id: 1,
            flags: 0,
            schema: "db".into(),
            table: "t".into(),
            column_count: 4,
            column_types: vec![3, 15, 8, 1],
            column_meta: vec![0, 255, 0, 0],
            null_bitmap: vec![0],
            // second and third numeric columns unsigned
            signedness_bitmap: Some(vec![0b0110_0000]),
            column_names: vec![],
            primary_key: vec![],
        };
        assert_eq!(
            table.unsigned_columns().unwrap(),
            vec![(0, false), (2, true), (3, true)]
        );
    }

    #[test]
    fn test_row_value_json() {
        assert_eq!(RowValue::UInt32(16_777_215).to_json(), Value::from(16_777_215u32));
        assert_eq!(RowValue::Null.to_string(), "NULL");
        assert_eq!(
            RowValue::Bytes(Bytes::from_static(&[0xff, 0x00])).to_json(),
            Value::String("ff00".into())
        );
    }
}
