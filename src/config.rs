//! Configuration for stratakv
//!
//! Centralized configuration with sensible defaults. A `Config` is validated
//! once when the database is opened and is immutable afterwards.

use std::path::PathBuf;

use crate::error::{Result, StrataError};
use crate::page::{self, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Default maximum key length (also bounds duplicate values). Builders
/// lower it to what the chosen page size can hold.
pub const DEFAULT_MAX_KEY_SIZE: usize = 511;

/// Default initial mapping size (1 MiB)
pub const DEFAULT_MAP_SIZE: u64 = 1 << 20;

/// Default ceiling for mapping growth (1 GiB)
pub const DEFAULT_MAX_MAP_SIZE: u64 = 1 << 30;

/// Default reader slot table capacity
pub const DEFAULT_MAX_READERS: usize = 126;

/// Default number of named buckets a transaction may open
pub const DEFAULT_MAX_BUCKETS: usize = 32;

/// Main configuration for a stratakv database
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Path of the single backing file
    pub path: PathBuf,

    /// Page size for newly created files. An existing file keeps the page
    /// size it was created with.
    pub page_size: usize,

    /// Initial size of the file mapping (bytes)
    pub map_size: u64,

    /// Upper bound for mapping growth (bytes)
    pub max_map_size: u64,

    // -------------------------------------------------------------------------
    // Limits
    // -------------------------------------------------------------------------
    /// Maximum key length in bytes
    pub max_key_size: usize,

    /// Capacity of the reader slot table
    pub max_readers: usize,

    /// Maximum named buckets open in one transaction
    pub max_buckets: usize,

    // -------------------------------------------------------------------------
    // Transaction Configuration
    // -------------------------------------------------------------------------
    /// Durability policy applied at commit
    pub sync_mode: SyncMode,

    /// Dirty pages held by a top-level write transaction before spilling
    pub spill_threshold: usize,

    /// Hard limit on dirty pages per write transaction
    pub max_dirty_pages: usize,
}

/// Commit durability policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Flush data pages, then flush the meta page (safest)
    Full,

    /// Flush data pages but leave the meta page to the OS
    NoMetaSync,

    /// Never flush at commit; call `Database::sync` explicitly
    NoSync,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./stratakv.db"),
            page_size: DEFAULT_PAGE_SIZE,
            map_size: DEFAULT_MAP_SIZE,
            max_map_size: DEFAULT_MAX_MAP_SIZE,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            max_readers: DEFAULT_MAX_READERS,
            max_buckets: DEFAULT_MAX_BUCKETS,
            sync_mode: SyncMode::Full,
            spill_threshold: 1024,
            max_dirty_pages: 1 << 17,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check every limit once; called by `Database::open`
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(StrataError::Config(format!(
                "page size {} must be a power of two in [{}, {}]",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }

        if self.map_size < 2 * self.page_size as u64 {
            return Err(StrataError::Config(format!(
                "map size {} is smaller than two pages",
                self.map_size
            )));
        }

        if self.max_map_size < self.map_size {
            return Err(StrataError::Config(format!(
                "max map size {} is below the initial map size {}",
                self.max_map_size, self.map_size
            )));
        }

        let key_limit = page::max_key_size_for(self.page_size);
        if self.max_key_size == 0 || self.max_key_size > key_limit {
            return Err(StrataError::Config(format!(
                "max key size {} must be in [1, {}] for {}-byte pages",
                self.max_key_size, key_limit, self.page_size
            )));
        }

        if self.max_readers == 0 {
            return Err(StrataError::Config("max readers must be at least 1".into()));
        }

        if self.max_buckets == 0 {
            return Err(StrataError::Config("max buckets must be at least 1".into()));
        }

        if self.spill_threshold == 0 || self.spill_threshold > self.max_dirty_pages {
            return Err(StrataError::Config(format!(
                "spill threshold {} must be in [1, {}]",
                self.spill_threshold, self.max_dirty_pages
            )));
        }

        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
    /// `max_key_size` was chosen explicitly and is kept as given
    key_size_set: bool,
}

impl ConfigBuilder {
    /// Set the backing file path
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Set the page size used when creating a new file
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    /// Set the initial mapping size (in bytes)
    pub fn map_size(mut self, size: u64) -> Self {
        self.config.map_size = size;
        self
    }

    /// Set the mapping growth ceiling (in bytes)
    pub fn max_map_size(mut self, size: u64) -> Self {
        self.config.max_map_size = size;
        self
    }

    /// Set the maximum key length
    pub fn max_key_size(mut self, size: usize) -> Self {
        self.config.max_key_size = size;
        self.key_size_set = true;
        self
    }

    /// Set the reader slot table capacity
    pub fn max_readers(mut self, count: usize) -> Self {
        self.config.max_readers = count;
        self
    }

    /// Set the number of named buckets a transaction may open
    pub fn max_buckets(mut self, count: usize) -> Self {
        self.config.max_buckets = count;
        self
    }

    /// Set the commit durability policy
    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.config.sync_mode = mode;
        self
    }

    /// Set the dirty-page count that triggers a spill
    pub fn spill_threshold(mut self, pages: usize) -> Self {
        self.config.spill_threshold = pages;
        self
    }

    /// Set the hard dirty-page limit
    pub fn max_dirty_pages(mut self, pages: usize) -> Self {
        self.config.max_dirty_pages = pages;
        self
    }

    pub fn build(mut self) -> Config {
        let page_size = self.config.page_size;
        if !self.key_size_set && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            self.config.max_key_size = DEFAULT_MAX_KEY_SIZE.min(page::max_key_size_for(page_size));
        }
        self.config
    }
}
