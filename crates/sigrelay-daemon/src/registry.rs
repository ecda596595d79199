//! Subscription registry: the authoritative mapping from license
//! credentials to subscriptions, their state machine, and their
//! server-side sequence bookkeeping.
//!
//! # Access discipline
//!
//! - Hot-path reads ([`Registry::resolve_token`], [`Registry::snapshot`])
//!   are lock-free snapshots: they read committed rows and never touch
//!   the per-row locks.
//! - Every mutation of `{state, last_accepted_sequence}` happens under
//!   the per-subscription async lock AND an optimistic `version` check.
//!   A writer that loses the version race gets
//!   [`RegistryError::VersionConflict`] and must retry or surface the
//!   conflict; it must never blind-write.
//! - Trust-loop work serializes on a per-subscriber lock
//!   ([`Registry::subscriber_lock`]) so concurrent scoring passes cannot
//!   overwrite each other.
//!
//! License tokens are stored hash-only: the cleartext is returned exactly
//! once at issuance and never persisted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use sigrelay_core::policy::Policy;
use sigrelay_core::subscription::{StateEvent, SubscriptionState, TransitionError};
use tracing::info;
use uuid::Uuid;

/// Prefix on issued cleartext license tokens.
const TOKEN_PREFIX: &str = "srk_";

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A subscriber tried to subscribe to itself.
    #[error("subscriber {0} cannot subscribe to its own master stream")]
    SelfSubscription(String),

    /// The `(subscriber, master)` pair already has a subscription.
    #[error("subscription already exists for subscriber {subscriber_id} and master {master_id}")]
    DuplicatePair {
        /// Subscriber side of the pair.
        subscriber_id: String,
        /// Master side of the pair.
        master_id: String,
    },

    /// No such subscription.
    #[error("subscription {0} not found")]
    NotFound(String),

    /// The optimistic version check failed; another writer won the race.
    #[error("version conflict on subscription {subscription_id}")]
    VersionConflict {
        /// Subscription whose row moved underneath the writer.
        subscription_id: String,
    },

    /// The state machine rejected the transition.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// `last_accepted_sequence` would move backwards.
    #[error("last accepted sequence may not decrease ({current} -> {proposed})")]
    SequenceRegression {
        /// Stored value.
        current: u64,
        /// Rejected proposal.
        proposed: u64,
    },

    /// Underlying store failure.
    #[error("registry store error: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

/// Why a presented credential failed to resolve.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CredentialError {
    /// No token with this hash exists.
    #[error("unknown license token")]
    Unknown,
    /// The token was revoked.
    #[error("license token revoked")]
    Revoked,
    /// The token's validity window has passed.
    #[error("license token expired")]
    Expired,
}

/// Point-in-time view of one subscription row.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot {
    /// Subscription id.
    pub subscription_id: String,
    /// Subscriber side of the pair.
    pub subscriber_id: String,
    /// Master stream the subscription replicates.
    pub master_id: String,
    /// Current state.
    pub state: SubscriptionState,
    /// Server-side last accepted sequence.
    pub last_accepted_sequence: u64,
    /// High-water mark of delivered sequences.
    pub hwm: u64,
    /// Admission policy snapshot.
    pub policy: Policy,
    /// Optimistic-lock version of the row this snapshot was taken from.
    pub version: u64,
}

impl SubscriptionSnapshot {
    /// Whether signals should currently replicate onto the terminal.
    #[must_use]
    pub const fn can_trade(&self) -> bool {
        self.state.delivers_live()
    }
}

/// A freshly issued license. The cleartext token exists only in this
/// value; the registry keeps the hash.
#[derive(Debug)]
pub struct IssuedLicense {
    /// Cleartext token to hand to the user exactly once.
    pub token: String,
    /// Hash the registry stored.
    pub token_hash: String,
    /// Expiry, UTC milliseconds, when bounded.
    pub expires_at_ms: Option<i64>,
}

/// Credential resolution result used by the gateway and push server.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCredential {
    /// Subscription the token maps to.
    pub snapshot: SubscriptionSnapshot,
}

/// Compact status view for receivers and the dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStatus {
    /// Subscription id.
    pub subscription_id: String,
    /// Master the subscription replicates.
    pub master_id: String,
    /// Current state.
    pub state: SubscriptionState,
    /// Whether signals currently replicate onto the terminal.
    pub can_trade: bool,
}

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// `SQLite`-backed subscription registry.
pub struct Registry {
    conn: Arc<Mutex<Connection>>,
    row_locks: LockMap,
    subscriber_locks: LockMap,
}

impl Registry {
    /// Open (or create) a registry at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] if the database cannot be opened
    /// or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory registry for tests.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] if the database cannot be
    /// created.
    pub fn in_memory() -> Result<Self, RegistryError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, RegistryError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            row_locks: Mutex::new(HashMap::new()),
            subscriber_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Create tables and indexes.
    ///
    /// # Errors
    ///
    /// Returns the underlying `rusqlite` error on DDL failure.
    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS subscriptions (
                subscription_id TEXT PRIMARY KEY,
                subscriber_id TEXT NOT NULL,
                master_id TEXT NOT NULL,
                state TEXT NOT NULL,
                last_accepted_sequence INTEGER NOT NULL DEFAULT 0,
                hwm INTEGER NOT NULL DEFAULT 0,
                policy_json TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                state_reason TEXT,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                UNIQUE (subscriber_id, master_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS license_tokens (
                token_hash TEXT PRIMARY KEY,
                subscription_id TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                expires_at_ms INTEGER,
                ea_instance_binding TEXT,
                issued_at_ms INTEGER NOT NULL,
                revoked_at_ms INTEGER,
                revoked_reason TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_license_tokens_subscription
             ON license_tokens(subscription_id)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS delivery_cursors (
                subscription_id TEXT PRIMARY KEY,
                acked_sequence INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trust_scores (
                subscriber_id TEXT PRIMARY KEY,
                score INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RegistryError> {
        self.conn
            .lock()
            .map_err(|_| RegistryError::Store("connection lock poisoned".to_string()))
    }

    /// Per-subscription exclusive lock for control-plane writers.
    pub fn row_lock(&self, subscription_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock_for(&self.row_locks, subscription_id)
    }

    /// Per-subscriber exclusive lock for the trust loop.
    pub fn subscriber_lock(&self, subscriber_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock_for(&self.subscriber_locks, subscriber_id)
    }

    // ------------------------------------------------------------------
    // Subscription lifecycle
    // ------------------------------------------------------------------

    /// Create a subscription in `SYNCED`.
    ///
    /// # Errors
    ///
    /// Rejects self-subscription and duplicate `(subscriber, master)`
    /// pairs.
    pub fn create_subscription(
        &self,
        subscriber_id: &str,
        master_id: &str,
        policy: &Policy,
    ) -> Result<SubscriptionSnapshot, RegistryError> {
        if subscriber_id == master_id {
            return Err(RegistryError::SelfSubscription(subscriber_id.to_string()));
        }
        let subscription_id = format!("sub-{}", Uuid::new_v4());
        let now = Utc::now().timestamp_millis();
        let policy_json = serde_json::to_string(policy)
            .map_err(|e| RegistryError::Store(format!("serialize policy: {e}")))?;
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO subscriptions
             (subscription_id, subscriber_id, master_id, state, policy_json,
              created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                subscription_id,
                subscriber_id,
                master_id,
                SubscriptionState::Synced.as_str(),
                policy_json,
                now
            ],
        )?;
        if inserted == 0 {
            return Err(RegistryError::DuplicatePair {
                subscriber_id: subscriber_id.to_string(),
                master_id: master_id.to_string(),
            });
        }
        drop(conn);
        info!(subscription_id, subscriber_id, master_id, "subscription created");
        self.snapshot(&subscription_id)?
            .ok_or_else(|| RegistryError::NotFound(subscription_id))
    }

    /// Delete a subscription and its credentials and cursor.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when the row does not exist.
    pub fn delete_subscription(&self, subscription_id: &str) -> Result<(), RegistryError> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM subscriptions WHERE subscription_id = ?1",
            params![subscription_id],
        )?;
        if removed == 0 {
            return Err(RegistryError::NotFound(subscription_id.to_string()));
        }
        conn.execute(
            "DELETE FROM license_tokens WHERE subscription_id = ?1",
            params![subscription_id],
        )?;
        conn.execute(
            "DELETE FROM delivery_cursors WHERE subscription_id = ?1",
            params![subscription_id],
        )?;
        Ok(())
    }

    /// Lock-free snapshot of one subscription.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] on store failure.
    pub fn snapshot(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionSnapshot>, RegistryError> {
        let conn = self.lock_conn()?;
        snapshot_row(
            &conn,
            "SELECT subscription_id, subscriber_id, master_id, state,
                    last_accepted_sequence, hwm, policy_json, version
             FROM subscriptions WHERE subscription_id = ?1",
            params![subscription_id],
        )
    }

    /// Lock-free snapshots of every subscription of a master.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] on store failure.
    pub fn subscriptions_for_master(
        &self,
        master_id: &str,
    ) -> Result<Vec<SubscriptionSnapshot>, RegistryError> {
        self.snapshots_where("master_id = ?1", params![master_id])
    }

    /// Lock-free snapshots of every subscription of a subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] on store failure.
    pub fn subscriptions_for_subscriber(
        &self,
        subscriber_id: &str,
    ) -> Result<Vec<SubscriptionSnapshot>, RegistryError> {
        self.snapshots_where("subscriber_id = ?1", params![subscriber_id])
    }

    /// Distinct subscribers that currently have a subscription in
    /// `state`. The trust loop uses this to find paused subscribers
    /// that have gone quiet (no window events to surface them).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] on store failure.
    pub fn subscribers_in_state(
        &self,
        state: SubscriptionState,
    ) -> Result<Vec<String>, RegistryError> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT subscriber_id FROM subscriptions WHERE state = ?1")?;
        let rows = stmt.query_map(params![state.as_str()], |row| row.get(0))?;
        rows.collect::<Result<Vec<String>, _>>().map_err(Into::into)
    }

    fn snapshots_where(
        &self,
        predicate: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<SubscriptionSnapshot>, RegistryError> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT subscription_id, subscriber_id, master_id, state,
                    last_accepted_sequence, hwm, policy_json, version
             FROM subscriptions WHERE {predicate}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, map_snapshot)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.ok_or_else(|| RegistryError::Store("corrupt row".to_string()))?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    /// Apply a state-machine event under the row's optimistic version.
    ///
    /// Callers must hold [`Registry::row_lock`] for the subscription;
    /// the version check is the cross-process backstop, the lock is the
    /// in-process serialization.
    ///
    /// # Errors
    ///
    /// [`RegistryError::InvalidTransition`] if the state machine rejects
    /// the event, [`RegistryError::VersionConflict`] if another writer
    /// won the race.
    pub fn apply_event(
        &self,
        subscription_id: &str,
        event: StateEvent,
        reason: Option<&str>,
    ) -> Result<SubscriptionState, RegistryError> {
        let snapshot = self
            .snapshot(subscription_id)?
            .ok_or_else(|| RegistryError::NotFound(subscription_id.to_string()))?;
        self.apply_event_at(&snapshot, event, reason)
    }

    /// Compare-and-set form of [`Registry::apply_event`]: the caller's
    /// snapshot carries the expected version, so a decision computed
    /// from stale state can never be written over a newer row.
    ///
    /// # Errors
    ///
    /// Same as [`Registry::apply_event`].
    pub fn apply_event_at(
        &self,
        snapshot: &SubscriptionSnapshot,
        event: StateEvent,
        reason: Option<&str>,
    ) -> Result<SubscriptionState, RegistryError> {
        let subscription_id = snapshot.subscription_id.as_str();
        let next = snapshot.state.apply(event)?;
        let now = Utc::now().timestamp_millis();
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE subscriptions
             SET state = ?1, state_reason = ?2, updated_at_ms = ?3, version = version + 1
             WHERE subscription_id = ?4 AND version = ?5",
            params![
                next.as_str(),
                reason,
                now,
                subscription_id,
                snapshot.version
            ],
        )?;
        drop(conn);
        if updated == 0 {
            return Err(RegistryError::VersionConflict {
                subscription_id: subscription_id.to_string(),
            });
        }
        if next != snapshot.state {
            info!(
                subscription_id,
                from = %snapshot.state,
                to = %next,
                reason = reason.unwrap_or(""),
                "subscription state transition"
            );
        }
        Ok(next)
    }

    /// Advance the server-side `last_accepted_sequence` (non-decreasing)
    /// and the delivery high-water mark.
    ///
    /// # Errors
    ///
    /// [`RegistryError::SequenceRegression`] if `sequence` is below the
    /// stored value, [`RegistryError::VersionConflict`] on a lost race.
    pub fn record_accepted_sequence(
        &self,
        subscription_id: &str,
        sequence: u64,
    ) -> Result<(), RegistryError> {
        let snapshot = self
            .snapshot(subscription_id)?
            .ok_or_else(|| RegistryError::NotFound(subscription_id.to_string()))?;
        if sequence < snapshot.last_accepted_sequence {
            return Err(RegistryError::SequenceRegression {
                current: snapshot.last_accepted_sequence,
                proposed: sequence,
            });
        }
        let now = Utc::now().timestamp_millis();
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE subscriptions
             SET last_accepted_sequence = ?1, hwm = MAX(hwm, ?1),
                 updated_at_ms = ?2, version = version + 1
             WHERE subscription_id = ?3 AND version = ?4",
            params![sequence, now, subscription_id, snapshot.version],
        )?;
        if updated == 0 {
            return Err(RegistryError::VersionConflict {
                subscription_id: subscription_id.to_string(),
            });
        }
        Ok(())
    }

    /// Replace the admission policy. Takes effect on the next snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] on store failure or unknown id.
    pub fn update_policy(
        &self,
        subscription_id: &str,
        policy: &Policy,
    ) -> Result<(), RegistryError> {
        let policy_json = serde_json::to_string(policy)
            .map_err(|e| RegistryError::Store(format!("serialize policy: {e}")))?;
        let now = Utc::now().timestamp_millis();
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE subscriptions
             SET policy_json = ?1, updated_at_ms = ?2, version = version + 1
             WHERE subscription_id = ?3",
            params![policy_json, now, subscription_id],
        )?;
        if updated == 0 {
            return Err(RegistryError::NotFound(subscription_id.to_string()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // License credentials
    // ------------------------------------------------------------------

    /// Issue a license token for a subscription.
    ///
    /// The returned cleartext is shown to the user exactly once; only
    /// its SHA-256 is persisted.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown subscription.
    pub fn issue_license(
        &self,
        subscription_id: &str,
        valid_for_ms: Option<i64>,
    ) -> Result<IssuedLicense, RegistryError> {
        if self.snapshot(subscription_id)?.is_none() {
            return Err(RegistryError::NotFound(subscription_id.to_string()));
        }
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = format!("{TOKEN_PREFIX}{}", hex::encode(raw));
        let token_hash = hash_token(&token);
        let now = Utc::now().timestamp_millis();
        let expires_at_ms = valid_for_ms.map(|ttl| now + ttl);
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO license_tokens
             (token_hash, subscription_id, expires_at_ms, issued_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![token_hash, subscription_id, expires_at_ms, now],
        )?;
        drop(conn);
        info!(subscription_id, "license issued");
        Ok(IssuedLicense {
            token,
            token_hash,
            expires_at_ms,
        })
    }

    /// Revoke a license. Observable by the very next token resolution.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown token hash.
    pub fn revoke_license(&self, token_hash: &str, reason: &str) -> Result<(), RegistryError> {
        let now = Utc::now().timestamp_millis();
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE license_tokens
             SET is_active = 0, revoked_at_ms = ?1, revoked_reason = ?2
             WHERE token_hash = ?3",
            params![now, reason, token_hash],
        )?;
        if updated == 0 {
            return Err(RegistryError::NotFound(token_hash.to_string()));
        }
        info!(token_hash, reason, "license revoked");
        Ok(())
    }

    /// Resolve a presented cleartext token to its subscription.
    ///
    /// Lock-free; runs on every ingest packet and every receiver
    /// reconnect, so revocation is immediate.
    ///
    /// # Errors
    ///
    /// [`CredentialError`] describes why the token failed; the registry
    /// store erroring surfaces as [`CredentialError::Unknown`] after
    /// logging (fail closed).
    pub fn resolve_token(&self, token: &str) -> Result<ResolvedCredential, CredentialError> {
        let token_hash = hash_token(token);
        let Ok(conn) = self.conn.lock() else {
            return Err(CredentialError::Unknown);
        };
        let row: Option<(String, bool, Option<i64>)> = conn
            .query_row(
                "SELECT subscription_id, is_active, expires_at_ms
                 FROM license_tokens WHERE token_hash = ?1",
                params![token_hash],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get::<_, i64>(1)? != 0,
                        row.get(2)?,
                    ))
                },
            )
            .optional()
            .ok()
            .flatten();
        let Some((subscription_id, is_active, expires_at_ms)) = row else {
            return Err(CredentialError::Unknown);
        };
        if !is_active {
            return Err(CredentialError::Revoked);
        }
        if let Some(expiry) = expires_at_ms {
            if Utc::now().timestamp_millis() > expiry {
                return Err(CredentialError::Expired);
            }
        }
        let snapshot = snapshot_row(
            &conn,
            "SELECT subscription_id, subscriber_id, master_id, state,
                    last_accepted_sequence, hwm, policy_json, version
             FROM subscriptions WHERE subscription_id = ?1",
            params![subscription_id],
        )
        .ok()
        .flatten()
        .ok_or(CredentialError::Unknown)?;
        Ok(ResolvedCredential { snapshot })
    }

    /// Point status query for receivers and the dashboard.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] when the token does not resolve.
    pub fn status_for_token(&self, token: &str) -> Result<SubscriptionStatus, CredentialError> {
        let snapshot = self.resolve_token(token)?.snapshot;
        Ok(SubscriptionStatus {
            can_trade: snapshot.can_trade(),
            subscription_id: snapshot.subscription_id,
            master_id: snapshot.master_id,
            state: snapshot.state,
        })
    }

    // ------------------------------------------------------------------
    // Admin actions
    // ------------------------------------------------------------------

    /// Operator suspend. Runs under the same per-row lock discipline as
    /// the trust loop; callers hold [`Registry::row_lock`].
    ///
    /// # Errors
    ///
    /// Same as [`Registry::apply_event`].
    pub fn admin_suspend(
        &self,
        subscription_id: &str,
        reason: &str,
    ) -> Result<SubscriptionState, RegistryError> {
        self.apply_event(subscription_id, StateEvent::AdminSuspend, Some(reason))
    }

    /// Operator resume, back to `SYNCED`.
    ///
    /// # Errors
    ///
    /// Same as [`Registry::apply_event`].
    pub fn admin_resume(
        &self,
        subscription_id: &str,
        reason: &str,
    ) -> Result<SubscriptionState, RegistryError> {
        self.apply_event(subscription_id, StateEvent::AdminResume, Some(reason))
    }

    // ------------------------------------------------------------------
    // Delivery cursors
    // ------------------------------------------------------------------

    /// Last sequence positively acked by the receiver. Receiver-side
    /// admission rejections do NOT retract this: from the server's view
    /// the signal was delivered.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] on store failure.
    pub fn delivery_cursor(&self, subscription_id: &str) -> Result<u64, RegistryError> {
        let conn = self.lock_conn()?;
        let cursor = conn
            .query_row(
                "SELECT acked_sequence FROM delivery_cursors WHERE subscription_id = ?1",
                params![subscription_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor.unwrap_or(0))
    }

    /// Advance the delivery cursor (monotonic; stale acks are no-ops).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] on store failure.
    pub fn advance_delivery_cursor(
        &self,
        subscription_id: &str,
        sequence: u64,
    ) -> Result<(), RegistryError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO delivery_cursors (subscription_id, acked_sequence)
             VALUES (?1, ?2)
             ON CONFLICT(subscription_id)
             DO UPDATE SET acked_sequence = MAX(acked_sequence, excluded.acked_sequence)",
            params![subscription_id, sequence],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Trust scores
    // ------------------------------------------------------------------

    /// Current trust score; new subscribers start at 100.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] on store failure.
    pub fn trust_score(&self, subscriber_id: &str) -> Result<i32, RegistryError> {
        let conn = self.lock_conn()?;
        let score = conn
            .query_row(
                "SELECT score FROM trust_scores WHERE subscriber_id = ?1",
                params![subscriber_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(score.unwrap_or(sigrelay_core::trust::MAX_SCORE))
    }

    /// Persist a recomputed trust score. Callers must hold
    /// [`Registry::subscriber_lock`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] on store failure.
    pub fn store_trust_score(&self, subscriber_id: &str, score: i32) -> Result<(), RegistryError> {
        let now = Utc::now().timestamp_millis();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO trust_scores (subscriber_id, score, updated_at_ms)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(subscriber_id)
             DO UPDATE SET score = excluded.score, updated_at_ms = excluded.updated_at_ms",
            params![subscriber_id, score, now],
        )?;
        Ok(())
    }
}

fn lock_for(map: &LockMap, key: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = map.lock().expect("lock map poisoned");
    locks
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

type SnapshotRow = (
    String,
    String,
    String,
    String,
    u64,
    u64,
    String,
    u64,
);

#[allow(clippy::unnecessary_wraps)]
fn map_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<SubscriptionSnapshot>> {
    let (subscription_id, subscriber_id, master_id, state, last, hwm, policy_json, version): SnapshotRow = (
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    );
    let Some(state) = SubscriptionState::parse(&state) else {
        return Ok(None);
    };
    let Ok(policy) = serde_json::from_str(&policy_json) else {
        return Ok(None);
    };
    Ok(Some(SubscriptionSnapshot {
        subscription_id,
        subscriber_id,
        master_id,
        state,
        last_accepted_sequence: last,
        hwm,
        policy,
        version,
    }))
}

fn snapshot_row(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Option<SubscriptionSnapshot>, RegistryError> {
    let row = conn.query_row(sql, args, map_snapshot).optional()?;
    Ok(row.flatten())
}
