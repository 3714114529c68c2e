use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the transfer engine while moving bytes from a remote
/// source to a temporary local location
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create temporary file {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to temporary file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Cancellation is a user action, not a failure; everything else is
    /// surfaced as `failed(reason)` and may be retried.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

/// Errors from the record store or file store. These indicate systemic
/// problems with a store, not problems with a single episode, and propagate
/// up rather than being swallowed per-identity.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Record store corrupt at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize record: {0}")]
    SerializeFailed(#[from] serde_json::Error),
}

/// Errors surfaced by the download orchestrator for a single request
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Insufficient storage: {available} bytes free, {required} required")]
    InsufficientStorage { available: u64, required: u64 },

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Failed to commit download into permanent storage: {0}")]
    Commit(#[source] StoreError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Episode has no source URL to download from")]
    MissingSource,
}
