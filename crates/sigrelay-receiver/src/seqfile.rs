//! Durable last-accepted-sequence record.
//!
//! A fixed-size file holding one 64-bit big-endian sequence number,
//! written atomically: temp file in the same directory, fsync the data,
//! rename over the final path, fsync the directory. A crash at any
//! point leaves either the old complete record or the new complete
//! record, never a torn one.
//!
//! The guard persists the sequence here BEFORE placing an order, so the
//! on-disk value after any crash equals the last placed order's
//! sequence or at worst one greater that was rolled back — the
//! at-most-one-duplicate window the sequence guard then absorbs.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Size of the record: one big-endian `u64`.
const RECORD_LEN: usize = 8;

/// Errors from sequence-file operations.
#[derive(Debug, thiserror::Error)]
pub enum SeqFileError {
    /// The file exists but is not a valid record. Fail closed: the
    /// operator must resolve this, guessing a sequence would risk a
    /// silent skip or duplicate.
    #[error("corrupt sequence file {path}: {len} bytes, expected {RECORD_LEN}")]
    Corrupt {
        /// Offending path.
        path: PathBuf,
        /// Observed length.
        len: u64,
    },

    /// Filesystem failure.
    #[error("sequence file io error at {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Handle to the durable sequence record.
#[derive(Debug, Clone)]
pub struct SequenceFile {
    path: PathBuf,
}

impl SequenceFile {
    /// Handle for `path`; nothing is touched until `load` or `store`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_err(&self, source: std::io::Error) -> SeqFileError {
        SeqFileError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Read the persisted sequence. A missing file is sequence 0 (fresh
    /// receiver); a malformed file is an error, never a guess.
    ///
    /// # Errors
    ///
    /// [`SeqFileError::Corrupt`] for a wrong-size record,
    /// [`SeqFileError::Io`] for filesystem failure.
    pub fn load(&self) -> Result<u64, SeqFileError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(self.io_err(err)),
        };
        let len = file.metadata().map_err(|e| self.io_err(e))?.len();
        if len != RECORD_LEN as u64 {
            return Err(SeqFileError::Corrupt {
                path: self.path.clone(),
                len,
            });
        }
        let mut buf = [0u8; RECORD_LEN];
        file.read_exact(&mut buf).map_err(|e| self.io_err(e))?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Atomically persist `sequence`: write-then-flush into a temp file,
    /// rename into place, flush the directory.
    ///
    /// # Errors
    ///
    /// Returns [`SeqFileError::Io`] on filesystem failure; the previous
    /// record is intact in that case.
    pub fn store(&self, sequence: u64) -> Result<(), SeqFileError> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(|e| self.io_err(e))?;
            tmp.write_all(&sequence.to_be_bytes())
                .map_err(|e| self.io_err(e))?;
            tmp.sync_all().map_err(|e| self.io_err(e))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| self.io_err(e))?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                dir.sync_all().ok();
            }
        }
        Ok(())
    }
}
