//! Error types for the SOSI index engine.

use thiserror::Error;

/// Result type alias using SosiError.
pub type Result<T> = std::result::Result<T, SosiError>;

/// Errors that can occur in index and record-cache operations.
#[derive(Debug, Error)]
pub enum SosiError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File error: {path}: {reason}")]
    FileError { path: String, reason: String },

    // Cache consistency errors
    #[error("Short transfer at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Admin record corrupted: {0}")]
    AdminCorrupted(String),

    #[error("Index version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("Fingerprint mismatch: {0}")]
    FingerprintMismatch(String),

    #[error("Block not allocated in {table} table for index {index}")]
    BlockNotAllocated { table: &'static str, index: u64 },

    // Usage errors
    #[error("Illegal group number: {0}")]
    IllegalGroup(i64),

    #[error("Illegal column: {0}")]
    IllegalColumn(i32),

    #[error("Illegal line number: {0}")]
    IllegalLine(usize),

    #[error("Illegal point number: {0}")]
    IllegalPoint(usize),

    #[error("Illegal serial number: {0}")]
    IllegalSerial(i64),

    #[error("Control character in line {0}")]
    IllegalText(usize),

    #[error("No current group")]
    NoCurrentGroup,

    #[error("Invalid SOSI name: {0}")]
    InvalidName(String),

    #[error("Header conflict: {0}")]
    HeaderConflict(String),

    #[error("Unknown file: {0}")]
    UnknownFile(usize),

    #[error("Too many groups: limit is {0}")]
    TooManyGroups(u32),

    #[error("Group is read-only")]
    ReadOnly,

    #[error("Group is referenced by other groups")]
    Referenced,

    // Source parsing errors
    #[error("Parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SosiError {
    /// Returns true for errors that mean the on-disk cache cannot be trusted.
    ///
    /// Opening a file converts these into a full rebuild instead of failing.
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            SosiError::ShortTransfer { .. }
                | SosiError::AdminCorrupted(_)
                | SosiError::VersionMismatch { .. }
                | SosiError::FingerprintMismatch(_)
                | SosiError::BlockNotAllocated { .. }
        )
    }
}
