//! Binlog coordinates

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// First event offset in every binlog file (after the 4 byte magic)
pub const BINLOG_START_POSITION: u32 = 4;

/// A (binlog file name, offset) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub name: String,
    pub pos: u32,
}

impl Position {
    pub fn new(name: impl Into<String>, pos: u32) -> Self {
        Self {
            name: name.into(),
            pos,
        }
    }

    /// Whether the position points at an actual file.
    pub fn is_set(&self) -> bool {
        !self.name.is_empty() && self.pos > 0
    }

    /// Order by file name, then offset.
    pub fn compare(&self, other: &Position) -> Ordering {
        compare_binlog_file_name(&self.name, &other.name).then(self.pos.cmp(&other.pos))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    /// [`Position::compare`], with the raw names breaking ties so that
    /// `Equal` agrees with `==` (`bin.01` and `bin.1` are distinct).
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other).then_with(|| self.name.cmp(&other.name))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.name, self.pos)
    }
}

/// Compare binlog file names such as `mysql-bin.000009` and `mysql-bin.000010`.
///
/// The server appends a numeric extension to the base name, so names with a
/// common base compare by that number. A missing or non-numeric extension
/// falls back to plain string comparison.
pub fn compare_binlog_file_name(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    match (split_binlog_name(a), split_binlog_name(b)) {
        (Some((a_base, a_seq)), Some((b_base, b_seq))) => {
            a_base.cmp(b_base).then(a_seq.cmp(&b_seq))
        }
        _ => a.cmp(b),
    }
}

fn split_binlog_name(name: &str) -> Option<(&str, u64)> {
    let (base, ext) = name.rsplit_once('.')?;
    let seq = ext.parse::<u64>().ok()?;
    Some((base, seq))
}
