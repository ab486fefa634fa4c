//! Storage configuration.
//!
//! Mirrors the options of [`MappedFileStorageFactory`](crate::MappedFileStorageFactory) so that
//! higher-level components can embed them in their own (JSON) configuration files.

use std::{env, fs, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Page size used by
/// [`MappedFileStorageFactory::with_default_page_size`](crate::MappedFileStorageFactory::with_default_page_size)
/// (1MB).
pub const DEFAULT_PAGE_SIZE: usize = 1 << 20;

/// Largest page size a single mapping may cover (1GB).
pub const MAX_PAGE_SIZE: usize = 1 << 30;

/// What to do when an existing file's length is not a multiple of the page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IfNotPageAligned {
    /// Fail the open with [`StorageError::NotPageAligned`].
    #[default]
    ThrowException,
    /// Grow the file up to the next page boundary, new bytes read as zero.
    ExpandFile,
    /// Truncate the file to zero length and start fresh.
    Clean,
}

/// Mapped storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Page size in bytes; must be set before opening
    #[serde(default)]
    pub page_size: Option<usize>,
    /// Create missing parent directories of the storage file (default: false)
    #[serde(default)]
    pub create_parent_directories: bool,
    /// Policy applied to a file whose length is not page-aligned
    #[serde(default)]
    pub if_file_is_not_page_aligned: IfNotPageAligned,
}

impl StorageConfig {
    /// Parse a config from a JSON document.
    pub fn from_json_str(json: &str) -> StorageResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load config from a JSON file, with environment variable overrides.
    /// Falls back to defaults if the file is not found.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut cfg = match fs::read_to_string(path) {
            Ok(s) => serde_json::from_str(&s)
                .with_context(|| format!("invalid storage config {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StorageConfig::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Validate and return the configured page size.
    pub fn validated_page_size(&self) -> StorageResult<usize> {
        let page_size = self
            .page_size
            .ok_or_else(|| StorageError::Config("page size must be set before open".into()))?;
        validate_page_size(page_size)?;
        Ok(page_size)
    }

    /// Apply MAPPED_STORAGE_* environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("MAPPED_STORAGE_PAGE_SIZE")
            && let Ok(size) = v.parse::<usize>()
        {
            self.page_size = Some(size);
        }

        if let Ok(v) = env::var("MAPPED_STORAGE_CREATE_PARENT_DIRS")
            && let Ok(flag) = v.parse::<bool>()
        {
            self.create_parent_directories = flag;
        }
    }
}

pub(crate) fn validate_page_size(page_size: usize) -> StorageResult<()> {
    if page_size == 0 || !page_size.is_power_of_two() {
        return Err(StorageError::Config(format!(
            "page size must be a positive power of two, got {page_size}"
        )));
    }
    if page_size > MAX_PAGE_SIZE {
        return Err(StorageError::Config(format!(
            "page size {page_size} exceeds maximum {MAX_PAGE_SIZE}"
        )));
    }
    Ok(())
}
