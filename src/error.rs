//! Error types for PE image loading.
//!
//! Only the outermost load path can fail: an image with a valid DOS header
//! always parses to *something*, and every deeper structure is reported
//! through presence flags rather than errors.

use thiserror::Error;

/// Top-level load errors.
#[derive(Debug, Error)]
pub enum PeError {
    /// The file could not be opened (file API only).
    #[error("cannot open file: {0}")]
    FileOpen(#[source] std::io::Error),

    /// The input holds fewer bytes than an MS-DOS header.
    #[error("file too small for a DOS header: {size} bytes")]
    FileSizeTooSmall { size: u64 },

    /// Memory-mapping the file failed (file API only).
    #[error("cannot map file: {0}")]
    FileMapping(#[source] std::io::Error),

    /// The MS-DOS `MZ` signature is absent.
    #[error("missing MS-DOS header signature")]
    NoDosHeader,
}

/// Result type alias for load operations.
pub type Result<T> = std::result::Result<T, PeError>;
