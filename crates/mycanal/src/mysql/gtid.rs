//! Global transaction identifier sets
//!
//! MySQL identifies a transaction by `source_uuid:transaction_number`; a set is
//! kept as disjoint, ascending, half-open intervals per source
//! (`3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5:7`). MariaDB identifies it by
//! `domain-server-sequence` and a set keeps the latest sequence per domain.

use crate::common::{CanalError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Server flavor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    #[default]
    MySql,
    MariaDb,
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flavor::MySql => write!(f, "mysql"),
            Flavor::MariaDb => write!(f, "mariadb"),
        }
    }
}

impl FromStr for Flavor {
    type Err = CanalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(Flavor::MySql),
            "mariadb" => Ok(Flavor::MariaDb),
            other => Err(CanalError::config(format!(
                "invalid flavor '{}', expected mysql or mariadb",
                other
            ))),
        }
    }
}

// ============================================================================
// MySQL GTID sets
// ============================================================================

/// Half-open interval `[start, stop)` of transaction numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub start: i64,
    pub stop: i64,
}

impl Interval {
    pub fn new(start: i64, stop: i64) -> Self {
        Self { start, stop }
    }

    /// Parse `1-5` (inclusive) or `7`.
    fn parse(s: &str) -> Result<Self> {
        let parse_num = |v: &str| {
            v.trim()
                .parse::<i64>()
                .map_err(|_| CanalError::protocol(format!("invalid GTID interval '{}'", s)))
        };
        let interval = match s.split_once('-') {
            Some((a, b)) => Interval::new(parse_num(a)?, parse_num(b)? + 1),
            None => {
                let n = parse_num(s)?;
                Interval::new(n, n + 1)
            }
        };
        if interval.stop <= interval.start || interval.start < 1 {
            return Err(CanalError::protocol(format!(
                "invalid GTID interval '{}'",
                s
            )));
        }
        Ok(interval)
    }

    fn contains(&self, other: &Interval) -> bool {
        self.start <= other.start && other.stop <= self.stop
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stop == self.start + 1 {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.stop - 1)
        }
    }
}

/// Sort and merge overlapping or adjacent intervals.
fn normalize(intervals: &mut Vec<Interval>) {
    if intervals.len() < 2 {
        return;
    }
    intervals.sort();
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for iv in intervals.drain(..) {
        match merged.last_mut() {
            Some(last) if iv.start <= last.stop => last.stop = last.stop.max(iv.stop),
            _ => merged.push(iv),
        }
    }
    *intervals = merged;
}

/// Executed transactions of one source server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidSet {
    pub sid: Uuid,
    pub intervals: Vec<Interval>,
}

impl UuidSet {
    pub fn new(sid: Uuid, mut intervals: Vec<Interval>) -> Self {
        normalize(&mut intervals);
        Self { sid, intervals }
    }

    fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let mut parts = s.split(':');
        let sid_str = parts.next().unwrap_or_default();
        let sid = Uuid::parse_str(sid_str.trim())
            .map_err(|e| CanalError::protocol(format!("invalid GTID source '{}': {}", sid_str, e)))?;
        let intervals = parts.map(Interval::parse).collect::<Result<Vec<_>>>()?;
        if intervals.is_empty() {
            return Err(CanalError::protocol(format!("GTID '{}' has no interval", s)));
        }
        Ok(Self::new(sid, intervals))
    }

    pub fn add_interval(&mut self, interval: Interval) {
        self.intervals.push(interval);
        normalize(&mut self.intervals);
    }

    fn contain(&self, other: &UuidSet) -> bool {
        other
            .intervals
            .iter()
            .all(|o| self.intervals.iter().any(|s| s.contains(o)))
    }
}

impl fmt::Display for UuidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sid.hyphenated())?;
        for iv in &self.intervals {
            write!(f, ":{}", iv)?;
        }
        Ok(())
    }
}

/// MySQL GTID set, ordered by source UUID
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MysqlGtidSet {
    sets: BTreeMap<Uuid, UuidSet>,
}

impl MysqlGtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `uuid:1-5:7,uuid2:3`. Whitespace and newlines are ignored.
    pub fn parse(s: &str) -> Result<Self> {
        let mut set = Self::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            set.add_uuid_set(UuidSet::parse(part)?);
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|s| s.intervals.is_empty())
    }

    pub fn uuid_sets(&self) -> impl Iterator<Item = &UuidSet> {
        self.sets.values()
    }

    pub fn add_uuid_set(&mut self, set: UuidSet) {
        match self.sets.get_mut(&set.sid) {
            Some(existing) => {
                existing.intervals.extend(set.intervals);
                normalize(&mut existing.intervals);
            }
            None => {
                self.sets.insert(set.sid, set);
            }
        }
    }

    /// Record one executed transaction.
    pub fn add_gtid(&mut self, sid: Uuid, gno: i64) {
        self.add_uuid_set(UuidSet::new(sid, vec![Interval::new(gno, gno + 1)]));
    }

    /// Union with another set.
    pub fn add_set(&mut self, other: &MysqlGtidSet) {
        for set in other.sets.values() {
            self.add_uuid_set(set.clone());
        }
    }

    /// Whether every transaction in `other` is also in `self`.
    pub fn contain(&self, other: &MysqlGtidSet) -> bool {
        other.sets.values().all(|o| {
            o.intervals.is_empty()
                || self
                    .sets
                    .get(&o.sid)
                    .map(|s| s.contain(o))
                    .unwrap_or(false)
        })
    }

    /// Wire encoding used by `COM_BINLOG_DUMP_GTID` and PreviousGTIDs events.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.sets.len() * 40);
        buf.put_u64_le(self.sets.len() as u64);
        for set in self.sets.values() {
            buf.put_slice(set.sid.as_bytes());
            buf.put_u64_le(set.intervals.len() as u64);
            for iv in &set.intervals {
                buf.put_i64_le(iv.start);
                buf.put_i64_le(iv.stop);
            }
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let short = || CanalError::protocol("truncated GTID set");

        if buf.remaining() < 8 {
            return Err(short());
        }
        let n_sids = buf.get_u64_le();
        let mut set = Self::new();
        for _ in 0..n_sids {
            if buf.remaining() < 24 {
                return Err(short());
            }
            let mut sid = [0u8; 16];
            buf.copy_to_slice(&mut sid);
            let n_intervals = buf.get_u64_le() as usize;
            if buf.remaining() < n_intervals.saturating_mul(16) {
                return Err(short());
            }
            let intervals = (0..n_intervals)
                .map(|_| Interval::new(buf.get_i64_le(), buf.get_i64_le()))
                .collect();
            set.add_uuid_set(UuidSet::new(Uuid::from_bytes(sid), intervals));
        }
        Ok(set)
    }
}

impl fmt::Display for MysqlGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for set in self.sets.values().filter(|s| !s.intervals.is_empty()) {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", set)?;
        }
        Ok(())
    }
}

// ============================================================================
// MariaDB GTID sets
// ============================================================================

/// One MariaDB GTID: `domain-server-sequence`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MariadbGtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub sequence_number: u64,
}

impl MariadbGtid {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || CanalError::protocol(format!("invalid MariaDB GTID '{}'", s));
        let mut parts = s.trim().splitn(3, '-');
        let mut next = || parts.next().ok_or_else(invalid);
        let domain_id = next()?.parse().map_err(|_| invalid())?;
        let server_id = next()?.parse().map_err(|_| invalid())?;
        let sequence_number = next()?.parse().map_err(|_| invalid())?;
        Ok(Self {
            domain_id,
            server_id,
            sequence_number,
        })
    }
}

impl fmt::Display for MariadbGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.domain_id, self.server_id, self.sequence_number
        )
    }
}

/// Latest GTID per replication domain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MariadbGtidSet {
    sets: BTreeMap<u32, MariadbGtid>,
}

impl MariadbGtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut set = Self::new();
        for part in s.split(',') {
            let part = part.trim();
            if !part.is_empty() {
                set.add_gtid(MariadbGtid::parse(part)?);
            }
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn gtids(&self) -> impl Iterator<Item = &MariadbGtid> {
        self.sets.values()
    }

    /// Keep the newest GTID of each domain.
    pub fn add_gtid(&mut self, gtid: MariadbGtid) {
        match self.sets.get(&gtid.domain_id) {
            Some(existing) if existing.sequence_number > gtid.sequence_number => {}
            _ => {
                self.sets.insert(gtid.domain_id, gtid);
            }
        }
    }

    pub fn add_set(&mut self, other: &MariadbGtidSet) {
        for gtid in other.sets.values() {
            self.add_gtid(*gtid);
        }
    }

    pub fn contain(&self, other: &MariadbGtidSet) -> bool {
        other.sets.values().all(|o| {
            self.sets
                .get(&o.domain_id)
                .map(|s| s.sequence_number >= o.sequence_number)
                .unwrap_or(false)
        })
    }
}

impl fmt::Display for MariadbGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.sets.values().map(|g| g.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

// ============================================================================
// Flavor-independent set
// ============================================================================

/// A GTID set of either flavor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GtidSet {
    MySql(MysqlGtidSet),
    MariaDb(MariadbGtidSet),
}

impl GtidSet {
    pub fn parse(flavor: Flavor, s: &str) -> Result<Self> {
        match flavor {
            Flavor::MySql => MysqlGtidSet::parse(s).map(GtidSet::MySql),
            Flavor::MariaDb => MariadbGtidSet::parse(s).map(GtidSet::MariaDb),
        }
    }

    pub fn empty(flavor: Flavor) -> Self {
        match flavor {
            Flavor::MySql => GtidSet::MySql(MysqlGtidSet::new()),
            Flavor::MariaDb => GtidSet::MariaDb(MariadbGtidSet::new()),
        }
    }

    pub fn flavor(&self) -> Flavor {
        match self {
            GtidSet::MySql(_) => Flavor::MySql,
            GtidSet::MariaDb(_) => Flavor::MariaDb,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            GtidSet::MySql(s) => s.is_empty(),
            GtidSet::MariaDb(s) => s.is_empty(),
        }
    }

    /// Union with a set of the same flavor.
    pub fn add_set(&mut self, other: &GtidSet) -> Result<()> {
        match (self, other) {
            (GtidSet::MySql(a), GtidSet::MySql(b)) => a.add_set(b),
            (GtidSet::MariaDb(a), GtidSet::MariaDb(b)) => a.add_set(b),
            _ => return Err(CanalError::invariant("cannot merge GTID sets of different flavors")),
        }
        Ok(())
    }

    /// Add one GTID in its text form.
    pub fn update(&mut self, gtid: &str) -> Result<()> {
        let other = GtidSet::parse(self.flavor(), gtid)?;
        self.add_set(&other)
    }

    pub fn contain(&self, other: &GtidSet) -> bool {
        match (self, other) {
            (GtidSet::MySql(a), GtidSet::MySql(b)) => a.contain(b),
            (GtidSet::MariaDb(a), GtidSet::MariaDb(b)) => a.contain(b),
            _ => false,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            GtidSet::MySql(s) => s.encode(),
            GtidSet::MariaDb(s) => Bytes::from(s.to_string()),
        }
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GtidSet::MySql(s) => write!(f, "{}", s),
            GtidSet::MariaDb(s) => write!(f, "{}", s),
        }
    }
}
