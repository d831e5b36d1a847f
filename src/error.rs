use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the compress and decompress pipelines.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("no files to compress")]
    EmptyInput,

    #[error("short read on {}: expected {expected} bytes, got {got}", path.display())]
    ReadShort {
        path: PathBuf,
        expected: u64,
        got: u64,
    },

    #[error("failed to read {}: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("LZ4 compression failed: {0}")]
    CompressFailed(String),

    #[error("failed to write {}: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("size mismatch: expected {expected} bytes, actual {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("bad archive magic")]
    BadMagic,

    #[error("unsupported archive version {0}")]
    VersionMismatch(u32),

    #[error("truncated archive metadata")]
    TruncatedMetadata,

    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),

    #[error("verification mismatch: {0}")]
    VerifyMismatch(String),

    #[error("TIFF error: {0}")]
    TiffBackend(String),

    #[error("index file corrupt: {0}")]
    IndexCorrupt(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
