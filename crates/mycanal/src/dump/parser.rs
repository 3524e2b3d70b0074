//! mysqldump output parsing
//!
//! The dump is produced with `--compact --skip-extended-insert`, so each
//! data row is a single `INSERT INTO ... VALUES (...);` line. Besides rows,
//! the parser picks up the current database (`USE`), the binlog coordinates
//! written by `--master-data`/`--source-data` and the `GTID_PURGED` set.

use crate::common::{CanalError, Result};
use crate::mysql::Position;
use regex::Regex;
use std::sync::LazyLock;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

static BINLOG_EXP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^CHANGE (?:MASTER|REPLICATION SOURCE) TO (?:MASTER|SOURCE)_LOG_FILE='(.+)', (?:MASTER|SOURCE)_LOG_POS=(\d+);",
    )
    .unwrap()
});
static USE_EXP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^USE `(.+)`;").unwrap());
static VALUES_EXP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^INSERT INTO `(.+?)` VALUES \((.+)\);$").unwrap());
static GTID_EXP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\w{8}(?:-\w{4}){3}-\w{12}(?::\d+(?:-\d+)?)+)").unwrap()
});

/// One meaningful line of dump output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpItem {
    /// Binlog coordinates consistent with the dumped data
    BinlogPosition(Position),
    /// A part of the executed GTID set (one source UUID)
    GtidSet(String),
    /// One table row; values keep their SQL literal form
    Row {
        schema: String,
        table: String,
        values: Vec<String>,
    },
}

/// Line-by-line dump parser
#[derive(Debug, Default)]
pub struct DumpParser {
    schema: String,
    parse_binlog_pos: bool,
    binlog_parsed: bool,
    in_gtid_purged: bool,
}

impl DumpParser {
    /// `parse_binlog_pos` is false when the dump ran without master data.
    pub fn new(parse_binlog_pos: bool) -> Self {
        Self {
            parse_binlog_pos,
            ..Default::default()
        }
    }

    /// Database selected by the last `USE` line.
    pub fn current_schema(&self) -> &str {
        &self.schema
    }

    /// Parse one line without its terminator.
    pub fn parse_line(&mut self, line: &str) -> Result<Vec<DumpItem>> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut items = Vec::new();

        if self.parse_binlog_pos && !self.binlog_parsed {
            if line.contains("GTID_PURGED") {
                self.in_gtid_purged = true;
            }
            if self.in_gtid_purged {
                items.extend(
                    GTID_EXP
                        .captures_iter(line)
                        .map(|c| DumpItem::GtidSet(c[1].to_string())),
                );
                if line.trim_end().ends_with(';') {
                    self.in_gtid_purged = false;
                }
            }

            if let Some(caps) = BINLOG_EXP.captures(line) {
                let pos = caps[2]
                    .parse::<u32>()
                    .map_err(|e| CanalError::dump(format!("invalid binlog position in '{}': {}", line, e)))?;
                items.push(DumpItem::BinlogPosition(Position::new(&caps[1], pos)));
                self.binlog_parsed = true;
            }
        }

        if let Some(caps) = USE_EXP.captures(line) {
            self.schema = caps[1].to_string();
        }

        if let Some(caps) = VALUES_EXP.captures(line) {
            let values = parse_values(&caps[2])?;
            items.push(DumpItem::Row {
                schema: self.schema.clone(),
                table: caps[1].to_string(),
                values,
            });
        }

        Ok(items)
    }
}

/// Split the body of `VALUES (...)` into SQL literals.
///
/// Strings keep their surrounding quotes and are unescaped; everything else
/// (numbers, `NULL`, `0x..` hex, `_binary '...'`) is returned verbatim.
pub fn parse_values(s: &str) -> Result<Vec<String>> {
    let bytes = s.as_bytes();
    let mut values = Vec::with_capacity(8);
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\'' {
            let start = i;
            let mut in_quote = false;
            while i < bytes.len() {
                match bytes[i] {
                    b'\\' if in_quote => i += 1,
                    b'\'' => in_quote = !in_quote,
                    b',' if !in_quote => break,
                    _ => {}
                }
                i += 1;
            }
            values.push(s[start..i.min(bytes.len())].to_string());
            i += 1;
        } else {
            let start = i;
            let mut escaped = false;
            i += 1;
            loop {
                match bytes.get(i) {
                    Some(b'\\') => {
                        escaped = true;
                        i += 2;
                    }
                    // '' is a quote inside the literal
                    Some(b'\'') if bytes.get(i + 1) == Some(&b'\'') => {
                        escaped = true;
                        i += 2;
                    }
                    Some(b'\'') => break,
                    Some(_) => i += 1,
                    None => {
                        return Err(CanalError::dump(format!("unterminated string in values: {}", s)));
                    }
                }
            }
            values.push(if escaped {
                format!("'{}'", unescape_string(&s[start + 1..i]))
            } else {
                s[start..=i].to_string()
            });
            // closing quote, then the separator if any
            i += 1;
            if bytes.get(i) == Some(&b',') {
                i += 1;
            }
        }
    }

    Ok(values)
}

/// Undo mysqldump escaping of the text between a literal's quotes.
pub fn unescape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            chars.next_if_eq(&'\'');
            out.push(c);
            continue;
        }
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('0') => out.push('\0'),
            Some('b') => out.push('\u{8}'),
            Some('Z') => out.push('\u{1a}'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

/// Feed every line of `reader` through `parser`, sending items on `tx`.
///
/// Fails with `Cancelled` when the receiver goes away.
pub async fn parse_stream<R>(
    mut reader: R,
    parser: &mut DumpParser,
    tx: &mpsc::Sender<DumpItem>,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(16 * 1024);
    let mut lines = 0u64;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(lines);
        }
        lines += 1;
        let line = String::from_utf8_lossy(&buf);
        for item in parser.parse_line(&line)? {
            tx.send(item).await.map_err(|_| CanalError::Cancelled)?;
        }
    }
}
