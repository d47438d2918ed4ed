use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("missing config file bioarchive-sync.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    InvalidConfig(String),

    #[error("failed to read manifest {path}: {message}")]
    ManifestRead { path: PathBuf, message: String },

    #[error("package {package:?} is missing linkage key {key}")]
    MissingLinkageKey { package: String, key: String },

    #[error("linkage tuple {linkage:?} is shared by packages {first} and {second}")]
    LinkageCollision {
        linkage: Vec<String>,
        first: String,
        second: String,
    },

    #[error("md5 {md5} is claimed by more than one resource: {filenames:?}")]
    DuplicateResourceMd5 { md5: String, filenames: Vec<String> },

    #[error("resource {filename} (ticket {ticket}) carries no md5")]
    MissingResourceMd5 { filename: String, ticket: String },

    #[error("invalid chunk size {0}: must be a power of two and a multiple of 64")]
    InvalidChunkSize(u64),

    #[error("{kind} {id} not found in catalog")]
    CatalogNotFound { kind: String, id: String },

    #[error("catalog rejected {action}: {message}")]
    CatalogConflict { action: String, message: String },

    #[error("catalog refused credentials for {action}")]
    CatalogAuth { action: String },

    #[error("catalog has no {action} action")]
    UnsupportedAction { action: String },

    #[error("catalog request failed: {0}")]
    CatalogTransport(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogServer { status: u16, message: String },

    #[error("archive refused credentials for {url}")]
    ProbeAuth { url: String },

    #[error("origin request failed for {url}: {message}")]
    OriginHttp { url: String, message: String },

    #[error("origin returned status {status} for {url}")]
    OriginStatus { status: u16, url: String },

    #[error(
        "downloaded bytes for {filename} (ticket {ticket}) hash to {actual}, expected {expected}"
    )]
    ChecksumMismatch {
        filename: String,
        ticket: String,
        expected: String,
        actual: String,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Auth failures and cancellation stop a sync outright; everything else
    /// is scoped to the record that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::CatalogAuth { .. } | SyncError::ProbeAuth { .. } | SyncError::Cancelled
        )
    }
}
