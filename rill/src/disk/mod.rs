use std::sync::Arc;
use crate::Bitfield;

mod piece;
mod store;
#[cfg(test)]
mod tests;

pub use piece::Span;
pub use store::Store;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("io error: expected {expected} bytes, got {actual}")]
    IoSizeError {
        expected: usize,
        actual: usize,
    },

    #[error("cannot open {path:?}: {source}")]
    OpenError {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("piece index {0} out of range")]
    InvalidPiece(usize),

    // Usually relating to poisoned file locks.
    #[error("sync error: {0}")]
    SyncError(String),

    #[error("disk task failed: {0}")]
    TaskError(#[from] tokio::task::JoinError),

}

impl<T> From<std::sync::PoisonError<T>> for DiskError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        DiskError::SyncError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;

// Async wrappers, file io is blocking so it runs on the blocking pool.

pub async fn write_piece(store: Arc<Store>, idx: usize, data: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || store.write_piece(idx, &data)).await?
}

pub async fn read_cached(store: Arc<Store>, idx: usize) -> Result<Arc<Vec<u8>>> {
    tokio::task::spawn_blocking(move || store.read_cached(idx)).await?
}

pub async fn check_existing(store: Arc<Store>) -> Result<Bitfield> {
    Ok(tokio::task::spawn_blocking(move || store.check_existing()).await?)
}
