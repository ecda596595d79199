//! Durable, append-only, per-master signal log backed by `SQLite`.
//!
//! The log is both the fan-out bus and the short-term replay store for
//! gap recovery. Ordering holds per master partition only; cross-master
//! ordering is neither guaranteed nor required.
//!
//! # Durability invariant
//!
//! Any signal for which [`SignalLog::append`] returned an offset is
//! recoverable after a single node crash: the store runs in WAL mode
//! with `synchronous=FULL`, so the append has reached disk before the
//! call returns.
//!
//! Offsets are per-master, contiguous, and start at 1.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use sigrelay_core::signal::Signal;

/// Errors from signal-log operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The underlying store refused the operation.
    #[error("signal log unavailable: {detail}")]
    Unavailable {
        /// Store-level failure detail.
        detail: String,
    },

    /// A stored signal could not be deserialized.
    #[error("corrupt log record at {master_id}/{offset}: {detail}")]
    Corrupt {
        /// Partition of the bad record.
        master_id: String,
        /// Offset of the bad record.
        offset: u64,
        /// Parse failure detail.
        detail: String,
    },
}

impl From<rusqlite::Error> for LogError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Unavailable {
            detail: err.to_string(),
        }
    }
}

/// The contract the rest of the daemon programs against.
pub trait SignalLog: Send + Sync {
    /// Durably append a stamped signal under its master partition.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Unavailable`] if the write did not reach
    /// disk; the caller must NOT ack the producer in that case.
    fn append(&self, signal: &Signal) -> Result<u64, LogError>;

    /// Read signals strictly after `after_offset`, in append order.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the store cannot be read.
    fn read_from(
        &self,
        master_id: &str,
        after_offset: u64,
        limit: usize,
    ) -> Result<Vec<(u64, Signal)>, LogError>;

    /// Read signals with sequence strictly greater than `after_sequence`,
    /// in append order. Used to resume a receiver from its advertised
    /// `last_accepted_sequence`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the store cannot be read.
    fn read_after_sequence(
        &self,
        master_id: &str,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<(u64, Signal)>, LogError>;

    /// Drop records with offset strictly below `before_offset`.
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the store cannot be written.
    fn trim(&self, master_id: &str, before_offset: u64) -> Result<usize, LogError>;

    /// Highest appended sequence for a master, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the store cannot be read.
    fn head_sequence(&self, master_id: &str) -> Result<Option<u64>, LogError>;
}

/// `SQLite`-backed signal log.
#[derive(Clone)]
pub struct SqliteSignalLog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSignalLog {
    /// Open (or create) a log at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Unavailable`] if the database cannot be
    /// opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory log for tests.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Unavailable`] if the database cannot be
    /// created.
    pub fn in_memory() -> Result<Self, LogError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, LogError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create tables and indexes.
    ///
    /// # Errors
    ///
    /// Returns the underlying `rusqlite` error on DDL failure.
    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS signal_log (
                master_id TEXT NOT NULL,
                offset INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                appended_at_ms INTEGER NOT NULL,
                signal_json TEXT NOT NULL,
                PRIMARY KEY (master_id, offset)
            )",
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_signal_log_sequence
             ON signal_log(master_id, sequence)",
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, LogError> {
        self.conn.lock().map_err(|_| LogError::Unavailable {
            detail: "connection lock poisoned".to_string(),
        })
    }

    /// Retention sweep: drop records stamped before `before_ms` across
    /// all masters. Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the store cannot be written.
    pub fn trim_stamped_before(&self, before_ms: i64) -> Result<usize, LogError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM signal_log WHERE appended_at_ms < ?1",
            params![before_ms],
        )?;
        Ok(removed)
    }
}

fn row_to_signal(master_id: &str, offset: u64, json: &str) -> Result<Signal, LogError> {
    serde_json::from_str(json).map_err(|e| LogError::Corrupt {
        master_id: master_id.to_string(),
        offset,
        detail: e.to_string(),
    })
}

impl SignalLog for SqliteSignalLog {
    fn append(&self, signal: &Signal) -> Result<u64, LogError> {
        let json = serde_json::to_string(signal).map_err(|e| LogError::Unavailable {
            detail: format!("serialize: {e}"),
        })?;
        let arrival = signal.server_arrival_ms.unwrap_or(0);
        let conn = self.lock()?;
        let offset: u64 = conn.query_row(
            "INSERT INTO signal_log (master_id, offset, sequence, appended_at_ms, signal_json)
             SELECT ?1,
                    COALESCE((SELECT MAX(offset) FROM signal_log WHERE master_id = ?1), 0) + 1,
                    ?2, ?3, ?4
             RETURNING offset",
            params![signal.master_id, signal.sequence, arrival, json],
            |row| row.get(0),
        )?;
        Ok(offset)
    }

    fn read_from(
        &self,
        master_id: &str,
        after_offset: u64,
        limit: usize,
    ) -> Result<Vec<(u64, Signal)>, LogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT offset, signal_json FROM signal_log
             WHERE master_id = ?1 AND offset > ?2
             ORDER BY offset ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![master_id, after_offset, limit as i64], |row| {
            Ok((row.get::<_, u64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (offset, json) = row?;
            out.push((offset, row_to_signal(master_id, offset, &json)?));
        }
        Ok(out)
    }

    fn read_after_sequence(
        &self,
        master_id: &str,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<(u64, Signal)>, LogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT offset, signal_json FROM signal_log
             WHERE master_id = ?1 AND sequence > ?2
             ORDER BY offset ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![master_id, after_sequence, limit as i64], |row| {
            Ok((row.get::<_, u64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (offset, json) = row?;
            out.push((offset, row_to_signal(master_id, offset, &json)?));
        }
        Ok(out)
    }

    fn trim(&self, master_id: &str, before_offset: u64) -> Result<usize, LogError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM signal_log WHERE master_id = ?1 AND offset < ?2",
            params![master_id, before_offset],
        )?;
        Ok(removed)
    }

    fn head_sequence(&self, master_id: &str) -> Result<Option<u64>, LogError> {
        let conn = self.lock()?;
        let head = conn
            .query_row(
                "SELECT sequence FROM signal_log WHERE master_id = ?1
                 ORDER BY offset DESC LIMIT 1",
                params![master_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigrelay_core::signal::Side;

    fn signal(master: &str, sequence: u64) -> Signal {
        let mut s = Signal::new(
            "sub-1",
            sequence,
            1_700_000_000_000 + i64::try_from(sequence).unwrap(),
            "EURUSD",
            Side::Buy,
            0.1,
            1.1,
        );
        s.master_id = master.to_string();
        s.server_arrival_ms = Some(s.generated_at_ms + 5);
        s
    }

    #[test]
    fn offsets_are_contiguous_per_master() {
        let log = SqliteSignalLog::in_memory().unwrap();
        assert_eq!(log.append(&signal("m-a", 1)).unwrap(), 1);
        assert_eq!(log.append(&signal("m-a", 2)).unwrap(), 2);
        assert_eq!(log.append(&signal("m-b", 1)).unwrap(), 1);
        assert_eq!(log.append(&signal("m-a", 5)).unwrap(), 3);
    }

    #[test]
    fn read_from_returns_strict_append_order() {
        let log = SqliteSignalLog::in_memory().unwrap();
        for seq in 1..=5 {
            log.append(&signal("m", seq)).unwrap();
        }
        let batch = log.read_from("m", 2, 10).unwrap();
        let offsets: Vec<u64> = batch.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![3, 4, 5]);
        let sequences: Vec<u64> = batch.iter().map(|(_, s)| s.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
    }

    #[test]
    fn read_after_sequence_resumes_past_gaps() {
        let log = SqliteSignalLog::in_memory().unwrap();
        for seq in [1, 2, 5, 6] {
            log.append(&signal("m", seq)).unwrap();
        }
        let batch = log.read_after_sequence("m", 2, 10).unwrap();
        let sequences: Vec<u64> = batch.iter().map(|(_, s)| s.sequence).collect();
        assert_eq!(sequences, vec![5, 6]);
    }

    #[test]
    fn trim_drops_only_older_records() {
        let log = SqliteSignalLog::in_memory().unwrap();
        for seq in 1..=4 {
            log.append(&signal("m", seq)).unwrap();
        }
        assert_eq!(log.trim("m", 3).unwrap(), 2);
        let remaining = log.read_from("m", 0, 10).unwrap();
        let offsets: Vec<u64> = remaining.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![3, 4]);
    }

    #[test]
    fn head_sequence_tracks_latest_append() {
        let log = SqliteSignalLog::in_memory().unwrap();
        assert_eq!(log.head_sequence("m").unwrap(), None);
        log.append(&signal("m", 7)).unwrap();
        assert_eq!(log.head_sequence("m").unwrap(), Some(7));
    }

    #[test]
    fn masters_are_isolated() {
        let log = SqliteSignalLog::in_memory().unwrap();
        log.append(&signal("m-a", 1)).unwrap();
        log.append(&signal("m-b", 9)).unwrap();
        assert!(log.read_from("m-a", 0, 10).unwrap().len() == 1);
        assert_eq!(log.head_sequence("m-b").unwrap(), Some(9));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.db");
        {
            let log = SqliteSignalLog::open(&path).unwrap();
            log.append(&signal("m", 1)).unwrap();
            log.append(&signal("m", 2)).unwrap();
        }
        let log = SqliteSignalLog::open(&path).unwrap();
        assert_eq!(log.head_sequence("m").unwrap(), Some(2));
        let rows = log.read_from("m", 0, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].1.server_arrival_ms, Some(rows[1].1.generated_at_ms + 5));
    }
}
