//! Database Module
//!
//! The handle that ties the collaborators together and hands out
//! transactions.
//!
//! ## Responsibilities
//! - Open or create the backing file and pick the authoritative meta page
//! - Register readers so the allocator knows the oldest live snapshot
//! - Allow at most one write transaction at a time

use std::path::Path;

use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{Result, StrataError};
use crate::meta::MetaManager;
use crate::page::max_key_size_for;
use crate::store::{PageStore, ReaderTable};
use crate::txn::{Limits, Transaction};

/// Environment-wide figures reported by `Database::info`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Info {
    pub page_size: usize,
    /// Current size of the file mapping in bytes
    pub map_size: u64,
    pub last_page: u64,
    pub last_txnid: u64,
    pub max_readers: usize,
    pub num_readers: usize,
}

/// An open database file
///
/// ## Concurrency Model: Single Writer / Many Readers
///
/// - **Writes**: serialized by `writer`, held for the whole life of a write
///   transaction. Lock order inside a commit: `store` → `meta`.
/// - **Reads**: never wait for the writer. A reader takes the `store` read
///   lock only while copying a page out of the map, and `meta` only while
///   registering its snapshot.
pub struct Database {
    config: Config,

    /// Page size of the file; may differ from the configured one
    page_size: usize,

    /// Key limit after clamping to the file's page size
    max_key_size: usize,

    /// Page numbers available below the growth ceiling
    max_pages: u64,

    /// Memory-mapped backing file
    pub(crate) store: RwLock<PageStore>,

    /// Authoritative meta record
    pub(crate) meta: RwLock<MetaManager>,

    /// Snapshot ids pinned by live readers
    pub(crate) readers: ReaderTable,

    /// Held by the single active write transaction
    writer: Mutex<()>,
}

impl Database {
    /// Open or create the database described by `config`
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let mut store = PageStore::open(
            &config.path,
            config.page_size,
            config.map_size,
            config.max_map_size,
        )?;

        let meta = if store.is_new() {
            MetaManager::init(&mut store)?
        } else {
            let page_size = MetaManager::detect_page_size(store.raw(), config.page_size)?;
            if page_size != config.page_size {
                tracing::warn!(
                    "{} uses {}-byte pages; ignoring configured page size {}",
                    config.path.display(),
                    page_size,
                    config.page_size
                );
                store.set_page_size(page_size);
            }
            MetaManager::load(&store)?
        };

        let page_size = store.page_size();
        let max_key_size = config.max_key_size.min(max_key_size_for(page_size));
        if max_key_size < config.max_key_size {
            tracing::warn!(
                "Max key size lowered from {} to {} for {}-byte pages",
                config.max_key_size,
                max_key_size,
                page_size
            );
        }

        let max_pages = config.max_map_size.max(store.len()) / page_size as u64;
        let current = *meta.current();
        tracing::info!(
            "Opened {} at txn {} ({} pages of {} bytes)",
            config.path.display(),
            current.txnid,
            current.last_page + 1,
            page_size
        );

        Ok(Self {
            readers: ReaderTable::new(config.max_readers),
            config,
            page_size,
            max_key_size,
            max_pages,
            store: RwLock::new(store),
            meta: RwLock::new(meta),
            writer: Mutex::new(()),
        })
    }

    /// Open `path` with default settings
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(Config::builder().path(path.as_ref()).build())
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Start a read-only transaction on the latest committed snapshot
    pub fn begin_read(&self) -> Result<Transaction<'_>> {
        Transaction::begin_read(self)
    }

    /// Start the write transaction, waiting for the current one to finish
    pub fn begin_write(&self) -> Result<Transaction<'_>> {
        let guard = self.writer.lock();
        Ok(Transaction::begin_write(self, guard))
    }

    /// Start the write transaction, failing with `Busy` if one is active
    pub fn try_begin_write(&self) -> Result<Transaction<'_>> {
        let guard = self.writer.try_lock().ok_or(StrataError::Busy)?;
        Ok(Transaction::begin_write(self, guard))
    }

    /// Run `f` in a read transaction
    pub fn view<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let txn = self.begin_read()?;
        let result = f(&txn);
        txn.abort();
        result
    }

    /// Run `f` in a write transaction, committing if it succeeds
    pub fn update<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let txn = self.begin_write()?;
        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn info(&self) -> Info {
        let meta = *self.meta.read().current();
        Info {
            page_size: self.page_size,
            map_size: self.store.read().len(),
            last_page: meta.last_page,
            last_txnid: meta.txnid,
            max_readers: self.readers.capacity(),
            num_readers: self.readers.active(),
        }
    }

    /// Flush everything to disk; needed with `SyncMode::NoSync`
    pub fn sync(&self) -> Result<()> {
        self.store.read().flush()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub(crate) fn limits(&self) -> Limits {
        Limits {
            max_pages: self.max_pages,
            max_dirty: self.config.max_dirty_pages,
            max_key_size: self.max_key_size,
        }
    }
}
