//! Replication coordinates owned by the canal
//!
//! The record is kept in memory behind a read-write lock and flushed to a
//! JSON file through [`save_json`]. Rotations and DDL force a write; row and
//! commit events only write once the flush interval has elapsed.

use crate::common::{load_json, save_json, Result};
use crate::mysql::{Flavor, GtidSet, Position};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// On-disk record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub addr: String,
    pub bin_name: String,
    pub bin_pos: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid_set: Option<String>,
    #[serde(default)]
    pub flavor: Flavor,
}

#[derive(Debug, Default)]
struct MasterState {
    position: Position,
    gtid_set: Option<GtidSet>,
    timestamp: u32,
    dirty: bool,
}

/// Last applied binlog coordinates
#[derive(Debug)]
pub struct MasterInfo {
    path: Option<PathBuf>,
    addr: String,
    flavor: Flavor,
    flush_interval: Duration,
    state: RwLock<MasterState>,
    last_save: Mutex<Option<Instant>>,
}

impl MasterInfo {
    /// Empty in-memory state that is never persisted.
    pub fn in_memory(addr: impl Into<String>, flavor: Flavor) -> Self {
        Self {
            path: None,
            addr: addr.into(),
            flavor,
            flush_interval: Duration::from_secs(1),
            state: RwLock::new(MasterState::default()),
            last_save: Mutex::new(None),
        }
    }

    /// Load the record at `path`.
    ///
    /// A missing file, or a record written for another server address, starts
    /// from empty coordinates.
    pub async fn load(
        path: Option<PathBuf>,
        addr: impl Into<String>,
        flavor: Flavor,
        flush_interval: Duration,
    ) -> Result<Self> {
        let mut info = Self::in_memory(addr, flavor);
        info.flush_interval = flush_interval;

        let Some(path) = path else {
            return Ok(info);
        };

        match load_json::<MasterRecord>(&path).await? {
            Some(record) if record.addr == info.addr => {
                let gtid_set = match record.gtid_set.as_deref() {
                    Some(text) if !text.is_empty() => Some(GtidSet::parse(record.flavor, text)?),
                    _ => None,
                };
                info!(
                    "Loaded master info from {}: {}:{} gtid={:?}",
                    path.display(),
                    record.bin_name,
                    record.bin_pos,
                    gtid_set.as_ref().map(|g| g.to_string())
                );
                let state = info.state.get_mut().map_err(poisoned)?;
                state.position = Position::new(record.bin_name, record.bin_pos);
                state.gtid_set = gtid_set;
            }
            Some(record) => {
                warn!(
                    "Master info at {} belongs to {}, not {}; starting from scratch",
                    path.display(),
                    record.addr,
                    info.addr
                );
            }
            None => debug!("No master info at {}", path.display()),
        }

        info.path = Some(path);
        Ok(info)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Record a new position. Returns false when it equals the stored one.
    pub fn update(&self, position: Position) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        if state.position == position {
            return false;
        }
        state.position = position;
        state.dirty = true;
        true
    }

    /// Record a new GTID set. Returns false when it equals the stored one.
    pub fn update_gtid_set(&self, gtid_set: GtidSet) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        if state.gtid_set.as_ref() == Some(&gtid_set) {
            return false;
        }
        state.gtid_set = Some(gtid_set);
        state.dirty = true;
        true
    }

    pub fn update_timestamp(&self, timestamp: u32) {
        if let Ok(mut state) = self.state.write() {
            state.timestamp = timestamp;
        }
    }

    pub fn position(&self) -> Position {
        self.state
            .read()
            .map(|s| s.position.clone())
            .unwrap_or_default()
    }

    pub fn gtid_set(&self) -> Option<GtidSet> {
        self.state.read().ok().and_then(|s| s.gtid_set.clone())
    }

    pub fn timestamp(&self) -> u32 {
        self.state.read().map(|s| s.timestamp).unwrap_or(0)
    }

    /// Whether the stored coordinates can resume replication.
    pub fn has_resume_point(&self) -> bool {
        let Ok(state) = self.state.read() else {
            return false;
        };
        let has_gtid = state.gtid_set.as_ref().is_some_and(|g| !g.is_empty());
        has_gtid || (!state.position.name.is_empty() && state.position.pos > 0)
    }

    pub fn record(&self) -> MasterRecord {
        let (position, gtid_set) = self
            .state
            .read()
            .map(|s| (s.position.clone(), s.gtid_set.clone()))
            .unwrap_or_default();
        MasterRecord {
            addr: self.addr.clone(),
            bin_name: position.name,
            bin_pos: position.pos,
            gtid_set: gtid_set.map(|g| g.to_string()),
            flavor: self.flavor,
        }
    }

    /// Flush the record to disk.
    ///
    /// Without a configured path this does nothing. Unforced writes only
    /// happen when something changed and the flush interval has elapsed.
    /// Returns whether a write happened.
    pub async fn persist(&self, force: bool) -> Result<bool> {
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };

        let dirty = self.state.read().map(|s| s.dirty).unwrap_or(false);
        if !force {
            if !dirty {
                return Ok(false);
            }
            let last = *self.last_save.lock().map_err(poisoned)?;
            if last.is_some_and(|at| at.elapsed() < self.flush_interval) {
                return Ok(false);
            }
        }

        let record = self.record();
        save_json(path, &record, true).await?;

        if let Ok(mut state) = self.state.write() {
            state.dirty = false;
        }
        *self.last_save.lock().map_err(poisoned)? = Some(Instant::now());
        debug!(
            "Persisted master info {}:{} to {}",
            record.bin_name,
            record.bin_pos,
            path.display()
        );
        Ok(true)
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> crate::common::CanalError {
    crate::common::CanalError::invariant("master info lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn mysql_set(text: &str) -> GtidSet {
        GtidSet::parse(Flavor::MySql, text).unwrap()
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let info = MasterInfo::load(
            Some(dir.path().join("master.info")),
            "127.0.0.1:3306",
            Flavor::MySql,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(info.position(), Position::default());
        assert!(info.gtid_set().is_none());
        assert!(!info.has_resume_point());
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.info");
        let info = MasterInfo::load(
            Some(path.clone()),
            "127.0.0.1:3306",
            Flavor::MySql,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        info.update(Position::new("mysql-bin.000003", 1024));
        info.update_gtid_set(mysql_set("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5"));
        assert!(info.persist(true).await.unwrap());

        let reloaded = MasterInfo::load(
            Some(path),
            "127.0.0.1:3306",
            Flavor::MySql,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(reloaded.position(), Position::new("mysql-bin.000003", 1024));
        assert_eq!(
            reloaded.gtid_set().unwrap().to_string(),
            "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5"
        );
        assert!(reloaded.has_resume_point());
    }

    #[tokio::test]
    async fn test_address_mismatch_resets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.info");
        let record = MasterRecord {
            addr: "10.0.0.1:3306".into(),
            bin_name: "mysql-bin.000009".into(),
            bin_pos: 77,
            gtid_set: None,
            flavor: Flavor::MySql,
        };
        save_json(&path, &record, false).await.unwrap();

        let info = MasterInfo::load(Some(path), "10.0.0.2:3306", Flavor::MySql, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(info.position(), Position::default());
    }

    #[tokio::test]
    async fn test_same_position_does_not_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.info");
        let info = MasterInfo::load(Some(path), "db:3306", Flavor::MySql, Duration::ZERO)
            .await
            .unwrap();

        assert!(info.update(Position::new("mysql-bin.000001", 120)));
        assert!(info.persist(false).await.unwrap());

        assert!(!info.update(Position::new("mysql-bin.000001", 120)));
        assert!(!info.persist(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_unforced_persist_is_throttled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.info");
        let info = MasterInfo::load(
            Some(path.clone()),
            "db:3306",
            Flavor::MySql,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

        info.update(Position::new("mysql-bin.000001", 120));
        assert!(info.persist(true).await.unwrap());

        info.update(Position::new("mysql-bin.000001", 500));
        assert!(!info.persist(false).await.unwrap());
        let on_disk: MasterRecord = load_json(&path).await.unwrap().unwrap();
        assert_eq!(on_disk.bin_pos, 120);

        assert!(info.persist(true).await.unwrap());
        let on_disk: MasterRecord = load_json(&path).await.unwrap().unwrap();
        assert_eq!(on_disk.bin_pos, 500);
    }

    #[tokio::test]
    async fn test_in_memory_never_persists() {
        let info = MasterInfo::in_memory("db:3306", Flavor::MariaDb);
        info.update(Position::new("mysql-bin.000001", 4));
        assert!(!info.persist(true).await.unwrap());
        assert_eq!(info.record().flavor, Flavor::MariaDb);
    }
}
