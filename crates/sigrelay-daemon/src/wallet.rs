//! Wallet oracle seam and the reference wallet store.
//!
//! The replication core never settles money; it only asks one question:
//! does this subscriber currently have non-zero spendable balance? The
//! [`WalletOracle`] trait is that question. The [`SqliteWallet`] here is
//! the reference implementation used by the daemon's control loop; a
//! deployment may answer from an external wallet system instead.
//!
//! # Debit discipline
//!
//! The wallet row is single-writer: a debit takes the per-wallet lock
//! with try-lock (`NOWAIT` semantics) and writes under an optimistic
//! version check. Hot-path readers never take the lock; their read is
//! advisory. [`WalletError::Locked`] and [`WalletError::VersionConflict`]
//! are the two locally-recoverable error kinds in the system and are
//! retried with bounded jitter.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

/// Attempts before a contended debit gives up.
const DEBIT_RETRY_LIMIT: u32 = 5;

/// Base backoff between debit retries; jittered up to 2x.
const DEBIT_RETRY_BASE: Duration = Duration::from_millis(5);

/// Errors from wallet operations.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    /// Another writer holds the wallet row lock (NOWAIT).
    #[error("wallet row locked for subscriber {0}")]
    Locked(String),

    /// The optimistic version check failed.
    #[error("wallet version conflict for subscriber {0}")]
    VersionConflict(String),

    /// Balance is below the requested debit.
    #[error("insufficient balance: {balance} < {requested}")]
    Insufficient {
        /// Current balance.
        balance: f64,
        /// Requested debit.
        requested: f64,
    },

    /// No wallet row for this subscriber.
    #[error("no wallet for subscriber {0}")]
    NotFound(String),

    /// The underlying store refused the operation.
    #[error("wallet store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for WalletError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Read-side capability consulted by admission decisions.
///
/// Answers are eventually consistent; callers treat a definitive `false`
/// as authoritative for that one decision only.
pub trait WalletOracle: Send + Sync {
    /// Whether the subscriber has non-zero spendable balance.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError`] when the source cannot answer; the caller
    /// decides between fail-closed and advisory handling.
    fn has_funds(&self, subscriber_id: &str) -> Result<bool, WalletError>;

    /// Current balance, when the source can see it. Used to annotate
    /// protection events; purely advisory.
    fn balance_hint(&self, subscriber_id: &str) -> Option<f64> {
        let _ = subscriber_id;
        None
    }
}

/// Oracle that always answers yes. Used in tests and in deployments
/// where funding is enforced elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFunded;

impl WalletOracle for AlwaysFunded {
    fn has_funds(&self, _subscriber_id: &str) -> Result<bool, WalletError> {
        Ok(true)
    }
}

/// `SQLite`-backed wallet store.
pub struct SqliteWallet {
    conn: Arc<Mutex<Connection>>,
    row_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SqliteWallet {
    /// Open (or create) a wallet store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::Unavailable`] if the database cannot be
    /// opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalletError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory wallet store for tests.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::Unavailable`] if the database cannot be
    /// created.
    pub fn in_memory() -> Result<Self, WalletError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, WalletError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            row_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Create tables.
    ///
    /// # Errors
    ///
    /// Returns the underlying `rusqlite` error on DDL failure.
    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallets (
                subscriber_id TEXT PRIMARY KEY,
                balance REAL NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, WalletError> {
        self.conn
            .lock()
            .map_err(|_| WalletError::Unavailable("connection lock poisoned".to_string()))
    }

    fn row_lock(&self, subscriber_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.row_locks.lock().expect("lock map poisoned");
        locks
            .entry(subscriber_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Credit a wallet, creating the row on first use.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::Unavailable`] on store failure.
    pub fn credit(&self, subscriber_id: &str, amount: f64) -> Result<(), WalletError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO wallets (subscriber_id, balance) VALUES (?1, ?2)
             ON CONFLICT(subscriber_id)
             DO UPDATE SET balance = balance + excluded.balance, version = version + 1",
            params![subscriber_id, amount],
        )?;
        Ok(())
    }

    /// Advisory balance read; never takes the row lock.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::NotFound`] when no row exists.
    pub fn balance(&self, subscriber_id: &str) -> Result<f64, WalletError> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT balance FROM wallets WHERE subscriber_id = ?1",
            params![subscriber_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| WalletError::NotFound(subscriber_id.to_string()))
    }

    /// One debit attempt: try-lock the row, then compare-and-set.
    ///
    /// # Errors
    ///
    /// [`WalletError::Locked`] if another writer holds the row,
    /// [`WalletError::VersionConflict`] on a lost CAS race,
    /// [`WalletError::Insufficient`] when the balance does not cover the
    /// amount.
    pub fn try_debit(&self, subscriber_id: &str, amount: f64) -> Result<f64, WalletError> {
        let row_lock = self.row_lock(subscriber_id);
        let Ok(_guard) = row_lock.try_lock() else {
            return Err(WalletError::Locked(subscriber_id.to_string()));
        };

        let (balance, version): (f64, u64) = {
            let conn = self.lock_conn()?;
            conn.query_row(
                "SELECT balance, version FROM wallets WHERE subscriber_id = ?1",
                params![subscriber_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| WalletError::NotFound(subscriber_id.to_string()))?
        };

        if balance < amount {
            return Err(WalletError::Insufficient {
                balance,
                requested: amount,
            });
        }

        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE wallets SET balance = balance - ?1, version = version + 1
             WHERE subscriber_id = ?2 AND version = ?3",
            params![amount, subscriber_id, version],
        )?;
        if updated == 0 {
            return Err(WalletError::VersionConflict(subscriber_id.to_string()));
        }
        Ok(balance - amount)
    }

    /// Debit with bounded jittered retries on the two recoverable error
    /// kinds. Everything else surfaces immediately.
    ///
    /// # Errors
    ///
    /// The last error after [`DEBIT_RETRY_LIMIT`] attempts, or the first
    /// non-recoverable one.
    pub async fn debit(&self, subscriber_id: &str, amount: f64) -> Result<f64, WalletError> {
        let mut attempt = 0;
        loop {
            match self.try_debit(subscriber_id, amount) {
                Err(err @ (WalletError::Locked(_) | WalletError::VersionConflict(_)))
                    if attempt + 1 < DEBIT_RETRY_LIMIT =>
                {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(1.0..2.0);
                    let backoff = DEBIT_RETRY_BASE.mul_f64(jitter * f64::from(attempt));
                    debug!(subscriber_id, attempt, ?err, "debit contended, retrying");
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }
}

impl WalletOracle for SqliteWallet {
    fn has_funds(&self, subscriber_id: &str) -> Result<bool, WalletError> {
        match self.balance(subscriber_id) {
            Ok(balance) => Ok(balance > 0.0),
            // No wallet row means nothing spendable, not an outage.
            Err(WalletError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn balance_hint(&self, subscriber_id: &str) -> Option<f64> {
        self.balance(subscriber_id).ok()
    }
}
