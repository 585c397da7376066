//! Persistence-sink interface for spilled entries.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Error raised by a [`PersistenceSink`] while writing a spilled handle.
#[derive(Debug, Error)]
pub enum SpillError {
    #[error("failed to write spilled model to `{destination}`: {source}")]
    Write {
        destination: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode spilled model for `{destination}`: {message}")]
    Encode {
        destination: PathBuf,
        message: String,
    },
}

/// Durable destination for entries the cache gives up.
///
/// The cache forwards the handle and destination unchanged and never
/// retries; a failure surfaces synchronously from the cache operation that
/// triggered the spill, after the entry has already been unlinked.
/// Implementations may block on I/O; the cache dispatches with its
/// internal lock released, so other cache operations do not wait on the
/// sink.
pub trait PersistenceSink<V>: Send + Sync {
    /// Persist `handle` at `destination`. Invoked exactly once per spilled
    /// entry.
    fn persist(&self, handle: &V, destination: &Path) -> Result<(), SpillError>;
}
