//! Error taxonomy for clustering and re-clustering.
//!
//! Validation, not-found and overlap errors are permanent. `UpdateRace` is the
//! only transient class: the caller re-reads the entry and recomputes rather
//! than replaying the stale write.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The entry changed between read and conditional write.
    #[error("concurrent modification of chunk {chunk_id} in project {project}")]
    UpdateRace { project: String, chunk_id: String },

    #[error("project {project}: an attempt which overlaps the proposed attempt already exists (last attempt {last_attempt}, proposed start {proposed_start})")]
    Overlap {
        project: String,
        last_attempt: String,
        proposed_start: String,
    },

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("storage: {0}")]
    Storage(#[from] rocksdb::Error),

    #[error("encoding: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("{0}")]
    Multi(MultiError),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    /// True for errors that may succeed when the whole operation is retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::UpdateRace { .. } => true,
            Error::Multi(multi) => !multi.0.is_empty() && multi.0.iter().all(Error::is_transient),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Errors collected from independent units of work, e.g. one per project.
#[derive(Debug, Default)]
pub struct MultiError(pub Vec<Error>);

impl MultiError {
    pub fn push(&mut self, err: Error) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn errors(&self) -> &[Error] {
        &self.0
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::Multi(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.0[0]),
            n => {
                write!(f, "{} (and {} other errors)", self.0[0], n - 1)
            }
        }
    }
}
