//! Protection-event sink: append-only, time-partitioned storage for
//! receiver reports and gateway rejections.
//!
//! Writes are best-effort from the receiver's perspective (a lost event
//! is tolerated; trust is a heuristic), but once a record reaches this
//! store it is never updated, only trimmed out by retention. The sink
//! feeds the trust loop and the operator views.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sigrelay_core::protection::{EventKind, ProtectionEvent};
use sigrelay_core::subscription::SubscriptionState;

/// Errors from sink operations.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The underlying store refused the operation.
    #[error("protection sink unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for SinkError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Per-reason aggregate for operator views and trust breakdowns.
#[derive(Debug, Clone, PartialEq)]
pub struct ReasonSummary {
    /// Stable kind string (`TTL_EXPIRED`, `EXECUTED`, ...).
    pub kind: String,
    /// Event count in the window.
    pub count: u64,
    /// Mean observed latency across the window's events.
    pub avg_latency_ms: f64,
}

/// `SQLite`-backed protection sink.
#[derive(Clone)]
pub struct ProtectionSink {
    conn: Arc<Mutex<Connection>>,
}

impl ProtectionSink {
    /// Open (or create) a sink at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory sink for tests.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the database cannot be created.
    pub fn in_memory() -> Result<Self, SinkError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, SinkError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
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
            "CREATE TABLE IF NOT EXISTS protection_events (
                event_id TEXT PRIMARY KEY,
                subscription_id TEXT NOT NULL,
                subscriber_id TEXT NOT NULL,
                day TEXT NOT NULL,
                event_time_ms INTEGER NOT NULL,
                kind TEXT NOT NULL,
                signal_sequence INTEGER NOT NULL,
                generated_at_ms INTEGER NOT NULL,
                arrival_time_ms INTEGER NOT NULL,
                observed_latency_ms INTEGER NOT NULL,
                observed_deviation REAL,
                state_at_event TEXT NOT NULL,
                wallet_balance REAL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_protection_events_subscriber
             ON protection_events(subscriber_id, event_time_ms)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_protection_events_day
             ON protection_events(day)",
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, SinkError> {
        self.conn
            .lock()
            .map_err(|_| SinkError::Unavailable("connection lock poisoned".to_string()))
    }

    /// Append one event. Never updates existing records.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the write fails; callers on the receiver
    /// report path treat that as a lost event, everything else treats it
    /// as a system failure worth surfacing.
    pub fn record(&self, event: &ProtectionEvent) -> Result<(), SinkError> {
        let day = partition_day(event.event_time_ms);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO protection_events
             (event_id, subscription_id, subscriber_id, day, event_time_ms, kind,
              signal_sequence, generated_at_ms, arrival_time_ms, observed_latency_ms,
              observed_deviation, state_at_event, wallet_balance)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                event.event_id,
                event.subscription_id,
                event.subscriber_id,
                day,
                event.event_time_ms,
                event.kind.as_str(),
                event.signal_sequence,
                event.generated_at_ms,
                event.arrival_time_ms,
                event.observed_latency_ms,
                event.observed_deviation_pips,
                event.state_at_event.as_str(),
                event.wallet_balance,
            ],
        )?;
        Ok(())
    }

    /// Event kinds for one subscriber since `since_ms`, oldest first.
    /// This is the trust loop's window query.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on store failure.
    pub fn kinds_for_subscriber(
        &self,
        subscriber_id: &str,
        since_ms: i64,
    ) -> Result<Vec<EventKind>, SinkError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT kind FROM protection_events
             WHERE subscriber_id = ?1 AND event_time_ms > ?2
             ORDER BY event_time_ms ASC",
        )?;
        let rows = stmt.query_map(params![subscriber_id, since_ms], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            if let Some(kind) = EventKind::parse(&row?) {
                out.push(kind);
            }
        }
        Ok(out)
    }

    /// Most recent negative (rejection) event time for a subscriber,
    /// across all retained history. Drives the recovery drift.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on store failure.
    pub fn last_rejection_ms(&self, subscriber_id: &str) -> Result<Option<i64>, SinkError> {
        let conn = self.lock()?;
        let last = conn
            .query_row(
                "SELECT MAX(event_time_ms) FROM protection_events
                 WHERE subscriber_id = ?1
                   AND kind NOT IN ('EXECUTED', 'ORDER_PLACEMENT_FAILED')",
                params![subscriber_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?;
        Ok(last.flatten())
    }

    /// Subscribers with at least one event since `since_ms`; the trust
    /// loop's work list.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on store failure.
    pub fn subscribers_since(&self, since_ms: i64) -> Result<Vec<String>, SinkError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT subscriber_id FROM protection_events
             WHERE event_time_ms > ?1",
        )?;
        let rows = stmt.query_map(params![since_ms], |row| row.get(0))?;
        rows.collect::<Result<Vec<String>, _>>().map_err(Into::into)
    }

    /// Recent full events for one subscription, newest first. Powers the
    /// operator view.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on store failure.
    pub fn recent_events(
        &self,
        subscription_id: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<ProtectionEvent>, SinkError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, subscription_id, subscriber_id, event_time_ms, kind,
                    signal_sequence, generated_at_ms, arrival_time_ms,
                    observed_latency_ms, observed_deviation, state_at_event, wallet_balance
             FROM protection_events
             WHERE subscription_id = ?1 AND event_time_ms > ?2
             ORDER BY event_time_ms DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![subscription_id, since_ms, limit as i64],
            map_event,
        )?;
        let mut out = Vec::new();
        for row in rows {
            if let Some(event) = row? {
                out.push(event);
            }
        }
        Ok(out)
    }

    /// Per-reason counts and mean latency for a subscriber's window.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on store failure.
    pub fn summary(
        &self,
        subscriber_id: &str,
        since_ms: i64,
    ) -> Result<Vec<ReasonSummary>, SinkError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT kind, COUNT(*), AVG(observed_latency_ms)
             FROM protection_events
             WHERE subscriber_id = ?1 AND event_time_ms > ?2
             GROUP BY kind ORDER BY COUNT(*) DESC",
        )?;
        let rows = stmt.query_map(params![subscriber_id, since_ms], |row| {
            Ok(ReasonSummary {
                kind: row.get(0)?,
                count: row.get(1)?,
                avg_latency_ms: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Drop whole day partitions older than `before_ms`. Returns the
    /// number of events removed.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on store failure.
    pub fn trim_before(&self, before_ms: i64) -> Result<usize, SinkError> {
        let day = partition_day(before_ms);
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM protection_events WHERE day < ?1",
            params![day],
        )?;
        Ok(removed)
    }
}

/// Day partition key for an event timestamp, UTC.
fn partition_day(event_time_ms: i64) -> String {
    Utc.timestamp_millis_opt(event_time_ms)
        .single()
        .map_or_else(|| "0000-00-00".to_string(), |dt| dt.format("%Y-%m-%d").to_string())
}

#[allow(clippy::unnecessary_wraps)]
fn map_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<ProtectionEvent>> {
    let kind_str: String = row.get(4)?;
    let state_str: String = row.get(10)?;
    let (Some(kind), Some(state)) = (
        EventKind::parse(&kind_str),
        SubscriptionState::parse(&state_str),
    ) else {
        return Ok(None);
    };
    Ok(Some(ProtectionEvent {
        event_id: row.get(0)?,
        subscription_id: row.get(1)?,
        subscriber_id: row.get(2)?,
        event_time_ms: row.get(3)?,
        kind,
        signal_sequence: row.get(5)?,
        generated_at_ms: row.get(6)?,
        arrival_time_ms: row.get(7)?,
        observed_latency_ms: row.get(8)?,
        observed_deviation_pips: row.get(9)?,
        state_at_event: state,
        wallet_balance: row.get(11)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigrelay_core::protection::RejectReason;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn event(subscriber: &str, kind: EventKind, time_ms: i64, latency: i64) -> ProtectionEvent {
        let mut e = ProtectionEvent::new(
            "sub-1",
            subscriber,
            time_ms,
            kind,
            1,
            time_ms - latency,
            time_ms - latency + 5,
            latency,
            SubscriptionState::Synced,
        );
        e.observed_deviation_pips = None;
        e
    }

    #[test]
    fn records_and_reads_back_window_kinds() {
        let sink = ProtectionSink::in_memory().unwrap();
        let base = 1_700_000_000_000;
        sink.record(&event(
            "u-1",
            EventKind::Rejected(RejectReason::TtlExpired),
            base + 10,
            650,
        ))
        .unwrap();
        sink.record(&event("u-1", EventKind::Executed, base + 20, 100))
            .unwrap();
        sink.record(&event(
            "u-2",
            EventKind::Rejected(RejectReason::Replay),
            base + 30,
            10,
        ))
        .unwrap();

        let kinds = sink.kinds_for_subscriber("u-1", base).unwrap();
        assert_eq!(
            kinds,
            vec![
                EventKind::Rejected(RejectReason::TtlExpired),
                EventKind::Executed
            ]
        );
        assert!(sink.kinds_for_subscriber("u-1", base + 25).unwrap().is_empty());
    }

    #[test]
    fn last_rejection_ignores_success_records() {
        let sink = ProtectionSink::in_memory().unwrap();
        let base = 1_700_000_000_000;
        assert_eq!(sink.last_rejection_ms("u-1").unwrap(), None);
        sink.record(&event(
            "u-1",
            EventKind::Rejected(RejectReason::SequenceGap),
            base,
            0,
        ))
        .unwrap();
        sink.record(&event("u-1", EventKind::Executed, base + 500, 10))
            .unwrap();
        sink.record(&event("u-1", EventKind::OrderFailed, base + 600, 10))
            .unwrap();
        assert_eq!(sink.last_rejection_ms("u-1").unwrap(), Some(base));
    }

    #[test]
    fn summary_groups_by_kind() {
        let sink = ProtectionSink::in_memory().unwrap();
        let base = 1_700_000_000_000;
        for latency in [600, 700] {
            sink.record(&event(
                "u-1",
                EventKind::Rejected(RejectReason::TtlExpired),
                base + latency,
                latency,
            ))
            .unwrap();
        }
        sink.record(&event("u-1", EventKind::Executed, base + 1000, 100))
            .unwrap();

        let summary = sink.summary("u-1", 0).unwrap();
        assert_eq!(summary.len(), 2);
        let ttl = summary.iter().find(|s| s.kind == "TTL_EXPIRED").unwrap();
        assert_eq!(ttl.count, 2);
        assert!((ttl.avg_latency_ms - 650.0).abs() < f64::EPSILON);
    }

    #[test]
    fn subscribers_since_is_the_work_list() {
        let sink = ProtectionSink::in_memory().unwrap();
        let base = 1_700_000_000_000;
        sink.record(&event("u-1", EventKind::Executed, base, 1)).unwrap();
        sink.record(&event(
            "u-2",
            EventKind::Rejected(RejectReason::TtlExpired),
            base + 100,
            1,
        ))
        .unwrap();
        let mut subscribers = sink.subscribers_since(base - 1).unwrap();
        subscribers.sort();
        assert_eq!(subscribers, vec!["u-1", "u-2"]);
        assert_eq!(sink.subscribers_since(base + 50).unwrap(), vec!["u-2"]);
    }

    #[test]
    fn retention_trims_whole_days() {
        let sink = ProtectionSink::in_memory().unwrap();
        let base = 1_700_000_000_000;
        sink.record(&event("u-1", EventKind::Executed, base - 91 * DAY_MS, 1))
            .unwrap();
        sink.record(&event("u-1", EventKind::Executed, base, 1)).unwrap();
        let removed = sink.trim_before(base - 90 * DAY_MS).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(sink.kinds_for_subscriber("u-1", 0).unwrap().len(), 1);
    }

    #[test]
    fn recent_events_roundtrip_fields() {
        let sink = ProtectionSink::in_memory().unwrap();
        let base = 1_700_000_000_000;
        let mut e = event(
            "u-1",
            EventKind::Rejected(RejectReason::PriceDeviation),
            base,
            120,
        );
        e.observed_deviation_pips = Some(60.0);
        e.wallet_balance = Some(10.5);
        sink.record(&e).unwrap();

        let events = sink.recent_events("sub-1", 0, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], e);
    }
}
