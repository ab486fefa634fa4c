//! Error definitions for mapped storage

use std::path::PathBuf;

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised while opening, growing, accessing or closing a mapped storage.
///
/// # Example
/// ```rust
/// use mapped_storage::{MappedFileStorageFactory, StorageError};
///
/// let dir = tempfile::tempdir().unwrap();
/// let result = MappedFileStorageFactory::default().open(dir.path().join("index.dat"));
///
/// match result {
///     Err(StorageError::Config(msg)) => println!("fix configuration: {msg}"),
///     Err(e) => println!("open failed: {e}"),
///     Ok(_) => unreachable!("page size was never set"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "File {} length ({length}) is not aligned to page size ({page_size})",
        path.display()
    )]
    NotPageAligned {
        path: PathBuf,
        length: u64,
        page_size: usize,
    },

    #[error("Storage {} is already open", .0.display())]
    AlreadyOpen(PathBuf),

    #[error("Storage {} is closed", .0.display())]
    Closed(PathBuf),

    #[error("Page {0} is unmapped")]
    Unmapped(u64),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Get a short error kind name
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::Io(_) => "io_error",
            StorageError::Config(_) => "config_error",
            StorageError::NotPageAligned { .. } => "not_page_aligned",
            StorageError::AlreadyOpen(_) => "already_open",
            StorageError::Closed(_) => "closed",
            StorageError::Unmapped(_) => "unmapped",
            StorageError::OutOfBounds(_) => "out_of_bounds",
            StorageError::InvalidInput(_) => "invalid_input",
            StorageError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
