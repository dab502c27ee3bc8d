//! # Append-Only Page Store
//!
//! This module implements `AppendOnlyPageStore`, the durable paged-file
//! store that ties the page type, persistence backend, shared cache, and
//! background writer together.
//!
//! ## Append-Only Identity Semantics
//!
//! Once committed, the page at a given id is immutable; updating a page
//! means allocating a new id and copying (`get_writable_page`). Readers can
//! therefore observe committed pages without locking against writers.
//!
//! ## Store State
//!
//! ```text
//! file:        |  committed pages (immutable)  |
//! ids:          1 .. new_page_offset-1          new_page_offset .. next_page_id-1
//! memory:                                      | new-page buffer (mutable) |
//! ```
//!
//! Pages with `id < new_page_offset` are committed; pages at or above it
//! live in the in-memory new-page buffer until the next commit. The file
//! is the concatenation of fixed-size pages with no header or footer, so
//! `next_page_id` falls out of the file length: `(len >> bit_shift) + 1`.
//! A trailing partial page (from a crash mid-commit) rounds away and is
//! abandoned on reopen.
//!
//! ## Write Path
//!
//! `create` reserves the next id and buffers a zero page. `write` mutates
//! the buffered page and, when background writes are enabled, queues it to
//! the writer so disk I/O overlaps the transaction. `commit` queues
//! whatever is still dirty, flushes the writer (the durability barrier),
//! restarts it, and promotes the pages into the shared cache as committed.
//! Restarting the writer around each commit bounds its in-memory retention
//! to one commit's worth of pages.
//!
//! ## Eviction Cooperation
//!
//! The store registers a before-evict listener for its partition. Committed
//! pages may always be evicted (they reload from the file). For a page
//! still in the new-page buffer the store either cancels the eviction (no
//! background writer: memory is the page's only home) or hands durability
//! to the writer by queueing the page with the sentinel transaction id 0.
//!
//! ## Threading Model
//!
//! Any number of threads may call `retrieve` concurrently. A single writer
//! thread is assumed for `create`/`write`/`commit`; this is a design
//! precondition provided by the transaction layer above, not enforced
//! here. The store never calls into the cache while holding its own state
//! lock, which keeps the eviction callback (which takes the state read
//! lock under the cache's shard lock) deadlock-free.

use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::config::{DEFAULT_PAGE_SIZE, PAGE_SIZE_ALIGNMENT};

use super::backend::{OpenMode, PageSource, PersistenceBackend};
use super::cache::{EvictionListener, EvictionVerdict, PageCache, Partition};
use super::page::Page;
use super::writer::BackgroundPageWriter;

/// Open-time options for a page store.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Page size in bytes; a power-of-two multiple of 4096. Fixed for the
    /// lifetime of the file.
    pub page_size: u32,
    /// Disables `create`/`write`/`commit`.
    pub readonly: bool,
    /// Forces synchronous commits and makes the eviction policy cancel
    /// rather than queue.
    pub disable_background_writes: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            readonly: false,
            disable_background_writes: false,
        }
    }
}

impl StoreOptions {
    /// Read-only access to an existing page file.
    pub fn readonly() -> Self {
        Self {
            readonly: true,
            ..Self::default()
        }
    }

    /// Writable store with synchronous commits.
    pub fn synchronous() -> Self {
        Self {
            disable_background_writes: true,
            ..Self::default()
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }
}

struct WriteState {
    next_page_id: u64,
    new_page_offset: u64,
    new_pages: SmallVec<[Arc<Page>; 8]>,
    writer: Option<BackgroundPageWriter>,
}

struct StoreInner {
    backend: Arc<dyn PersistenceBackend>,
    cache: Arc<PageCache>,
    path: PathBuf,
    partition: Partition,
    page_size: u32,
    readonly: bool,
    // Guards the shared seekable read handle; loads are seek-then-read.
    reader: Mutex<Option<Box<dyn PageSource>>>,
    state: RwLock<WriteState>,
    disposed: AtomicBool,
}

impl StoreInner {
    fn ensure_live(&self) -> Result<()> {
        ensure!(
            !self.disposed.load(Ordering::Acquire),
            "page store '{}' is disposed",
            self.path.display()
        );
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_live()?;
        ensure!(
            !self.readonly,
            "page store '{}' is read-only",
            self.path.display()
        );
        Ok(())
    }

    fn open_sink(&self) -> Result<Box<dyn super::backend::PageSink>> {
        self.backend
            .open_for_write(&self.path, OpenMode::Append)
            .wrap_err_with(|| {
                format!("failed to open page file '{}' for writing", self.path.display())
            })
    }
}

fn downgrade_listener<T: EvictionListener + 'static>(
    arc: &Arc<T>,
) -> std::sync::Weak<dyn EvictionListener> {
    let weak: std::sync::Weak<T> = Arc::downgrade(arc);
    weak
}

impl EvictionListener for StoreInner {
    fn before_evict(
        &self,
        _partition: &Partition,
        page_id: u64,
        cancellable: bool,
    ) -> EvictionVerdict {
        if self.disposed.load(Ordering::Acquire) {
            return EvictionVerdict::Evict;
        }

        let state = self.state.read();
        if page_id < state.new_page_offset {
            // Committed and reloadable from the file.
            return EvictionVerdict::Evict;
        }

        match &state.writer {
            None => {
                // The buffer is the page's only durable home.
                if cancellable {
                    EvictionVerdict::Retain
                } else {
                    EvictionVerdict::Evict
                }
            }
            Some(writer) => {
                let idx = (page_id - state.new_page_offset) as usize;
                if let Some(page) = state.new_pages.get(idx) {
                    // Hand durability to the writer; txn id 0 is the
                    // documented append-only sentinel.
                    writer.queue_write(Arc::clone(page), 0);
                }
                EvictionVerdict::Evict
            }
        }
    }
}

/// Durable, append-only store of fixed-size pages in one file.
pub struct AppendOnlyPageStore {
    inner: Arc<StoreInner>,
}

impl AppendOnlyPageStore {
    /// Opens (or, for a writable store, creates) the page file at `path`
    /// and registers the store's eviction listener with `cache`.
    pub fn open<P: AsRef<Path>>(
        backend: Arc<dyn PersistenceBackend>,
        cache: Arc<PageCache>,
        path: P,
        options: StoreOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let page_size = options.page_size;
        ensure!(
            page_size >= PAGE_SIZE_ALIGNMENT
                && page_size % PAGE_SIZE_ALIGNMENT == 0
                && page_size.is_power_of_two(),
            "invalid page size {}: must be a power-of-two multiple of {}",
            page_size,
            PAGE_SIZE_ALIGNMENT
        );
        let bit_shift = page_size.trailing_zeros();

        if !backend.file_exists(&path) {
            if options.readonly {
                bail!(
                    "page file '{}' does not exist and the store is read-only",
                    path.display()
                );
            }
            backend.create_file(&path).wrap_err_with(|| {
                format!("failed to create page file '{}'", path.display())
            })?;
        }

        let mut reader = backend.open_for_read(&path).wrap_err_with(|| {
            format!("failed to open page file '{}' for reading", path.display())
        })?;
        let file_len = reader.seek(SeekFrom::End(0)).wrap_err_with(|| {
            format!("failed to measure page file '{}'", path.display())
        })?;
        // Rounds down, abandoning any partial tail left by a crash.
        let next_page_id = (file_len >> bit_shift) + 1;

        let partition = Partition::new(&path);
        let inner = Arc::new(StoreInner {
            backend,
            cache: Arc::clone(&cache),
            path,
            partition: partition.clone(),
            page_size,
            readonly: options.readonly,
            reader: Mutex::new(Some(reader)),
            state: RwLock::new(WriteState {
                next_page_id,
                new_page_offset: next_page_id,
                new_pages: SmallVec::new(),
                writer: None,
            }),
            disposed: AtomicBool::new(false),
        });

        if !options.readonly && !options.disable_background_writes {
            let sink = inner.open_sink()?;
            inner.state.write().writer = Some(BackgroundPageWriter::start(sink)?);
        }

        let listener: std::sync::Weak<dyn EvictionListener> = downgrade_listener(&inner);
        cache.subscribe(partition, listener);

        Ok(Self { inner })
    }

    /// Retrieves the page with `page_id`, from the new-page buffer if the
    /// id is in the writable range, otherwise from the cache or the file.
    /// The returned page always has `page.id() == page_id`.
    pub fn retrieve(&self, page_id: u64) -> Result<Arc<Page>> {
        self.inner.ensure_live()?;
        ensure!(page_id >= 1, "page ids are 1-based, got {}", page_id);

        {
            let state = self.inner.state.read();
            if !self.inner.readonly && page_id >= state.new_page_offset {
                ensure!(
                    page_id < state.next_page_id,
                    "page {} has not been reserved in '{}'",
                    page_id,
                    self.inner.path.display()
                );
                let idx = (page_id - state.new_page_offset) as usize;
                return Ok(Arc::clone(&state.new_pages[idx]));
            }
        }

        if let Some(page) = self.inner.cache.lookup(&self.inner.partition, page_id) {
            return Ok(page);
        }

        let page = {
            let mut guard = self.inner.reader.lock();
            let reader = guard
                .as_mut()
                .ok_or_else(|| eyre::eyre!("page store '{}' is disposed", self.inner.path.display()))?;
            Arc::new(Page::new_loaded(reader.as_mut(), page_id, self.inner.page_size)?)
        };

        self.inner.cache.insert_or_update(&self.inner.partition, Arc::clone(&page));
        Ok(page)
    }

    /// Reserves the next page id and returns its zero-filled page.
    ///
    /// `_txn_id` is accepted for interface symmetry with stores that track
    /// creation transactions; append-only reservation does not need it.
    pub fn create(&self, _txn_id: u64) -> Result<Arc<Page>> {
        self.inner.ensure_writable()?;

        let page = {
            let mut state = self.inner.state.write();
            let page = Arc::new(Page::new_empty(state.next_page_id, self.inner.page_size));
            state.new_pages.push(Arc::clone(&page));
            state.next_page_id += 1;
            page
        };

        self.inner.cache.insert_or_update(&self.inner.partition, Arc::clone(&page));
        Ok(page)
    }

    /// Writes into the uncommitted page `page_id`. `len = None` copies from
    /// `src_offset` to the end of `data`. A page may be written any number
    /// of times before commit; only the bytes at commit time are durable.
    pub fn write(
        &self,
        txn_id: u64,
        page_id: u64,
        data: &[u8],
        src_offset: usize,
        page_offset: usize,
        len: Option<usize>,
    ) -> Result<()> {
        self.inner.ensure_writable()?;

        let state = self.inner.state.read();
        ensure!(
            page_id >= state.new_page_offset,
            "cannot write to fixed page {} in '{}'",
            page_id,
            self.inner.path.display()
        );
        ensure!(
            page_id < state.next_page_id,
            "cannot write to unreserved page {} in '{}'",
            page_id,
            self.inner.path.display()
        );

        let idx = (page_id - state.new_page_offset) as usize;
        let page = &state.new_pages[idx];
        page.set_data(data, src_offset, page_offset, len)?;

        if let Some(writer) = &state.writer {
            writer.queue_write(Arc::clone(page), txn_id);
        }
        Ok(())
    }

    /// Makes every page in the new-page buffer durable and visible as
    /// committed. On success the buffer is empty and the writable range is
    /// empty; on failure both are left in place so the caller can retry.
    pub fn commit(&self, txn_id: u64) -> Result<()> {
        self.inner.ensure_writable()?;

        let pages = {
            let mut state = self.inner.state.write();
            if state.new_pages.is_empty() {
                return Ok(());
            }

            if let Some(writer) = state.writer.take() {
                for page in &state.new_pages {
                    writer.queue_write(Arc::clone(page), txn_id);
                }
                let flushed = writer.flush();
                let shut = writer.shutdown();
                // Fresh writer per commit: the old one's retention is
                // bounded to the pages it just flushed.
                let sink = self.inner.open_sink()?;
                state.writer = Some(BackgroundPageWriter::start(sink)?);
                flushed?;
                shut?;
            } else {
                let mut sink = self.inner.open_sink()?;
                for page in &state.new_pages {
                    page.write(sink.as_mut(), txn_id)?;
                }
                sink.sync()?;
            }

            let pages = std::mem::take(&mut state.new_pages);
            state.new_page_offset = state.next_page_id;
            pages
        };

        // Promote outside the state lock: the flushed file already serves
        // reads for this range, and insertions may trigger evictions whose
        // callbacks take the state lock.
        for page in &pages {
            self.inner.cache.insert_or_update(&self.inner.partition, Arc::clone(page));
        }
        Ok(())
    }

    /// True if `page` falls in the writable range of this store.
    pub fn is_writable(&self, page: &Page) -> bool {
        !self.inner.readonly && page.id() >= self.inner.state.read().new_page_offset
    }

    /// Copy-on-write entry point: returns `page` itself if it is still
    /// writable, otherwise a fresh page carrying a copy of its bytes.
    pub fn get_writable_page(&self, txn_id: u64, page: &Arc<Page>) -> Result<Arc<Page>> {
        self.inner.ensure_writable()?;

        if self.is_writable(page) {
            return Ok(Arc::clone(page));
        }

        let copy = self.create(txn_id)?;
        {
            let data = page.data();
            copy.set_data(&data, 0, 0, None)?;
        }
        Ok(copy)
    }

    pub fn page_size(&self) -> u32 {
        self.inner.page_size
    }

    pub fn can_read(&self) -> bool {
        !self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn can_write(&self) -> bool {
        self.can_read() && !self.inner.readonly
    }

    pub fn partition(&self) -> &Partition {
        &self.inner.partition
    }

    /// Id the next `create` will hand out.
    pub fn next_page_id(&self) -> u64 {
        self.inner.state.read().next_page_id
    }

    /// Number of uncommitted pages in the new-page buffer.
    pub fn new_page_count(&self) -> usize {
        self.inner.state.read().new_pages.len()
    }

    /// Tears the store down: unsubscribes from the cache, shuts down the
    /// background writer (draining and flushing it), and releases the read
    /// stream. Idempotent; every operation after `close` fails.
    pub fn close(&self) -> Result<()> {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inner.cache.unsubscribe(&self.inner.partition);

        let writer = self.inner.state.write().writer.take();
        let result = match writer {
            Some(writer) => writer.shutdown(),
            None => Ok(()),
        };

        *self.inner.reader.lock() = None;
        result
    }
}

impl Drop for AppendOnlyPageStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemoryBackend;

    fn open_mem(
        backend: &MemoryBackend,
        cache: &Arc<PageCache>,
        path: &str,
        options: StoreOptions,
    ) -> Result<AppendOnlyPageStore> {
        AppendOnlyPageStore::open(
            Arc::new(backend.clone()),
            Arc::clone(cache),
            path,
            options,
        )
    }

    fn fresh_cache() -> Arc<PageCache> {
        Arc::new(PageCache::new(crate::config::DEFAULT_CACHE_CAPACITY).unwrap())
    }

    #[test]
    fn open_rejects_invalid_page_sizes() {
        let backend = MemoryBackend::new();
        let cache = fresh_cache();

        for bad in [0u32, 512, 4095, 6000, 12288] {
            let result = open_mem(
                &backend,
                &cache,
                "/db/bad",
                StoreOptions::default().with_page_size(bad),
            );
            assert!(result.is_err(), "page size {} should be rejected", bad);
            assert!(result.err().unwrap().to_string().contains("invalid page size"));
        }
    }

    #[test]
    fn open_readonly_requires_existing_file() {
        let backend = MemoryBackend::new();
        let cache = fresh_cache();

        let result = open_mem(&backend, &cache, "/db/missing", StoreOptions::readonly());

        assert!(result.is_err());
        assert!(result.err().unwrap().to_string().contains("read-only"));
    }

    #[test]
    fn create_hands_out_sequential_ids() {
        let backend = MemoryBackend::new();
        let cache = fresh_cache();
        let store = open_mem(&backend, &cache, "/db/a", StoreOptions::synchronous()).unwrap();

        assert_eq!(store.next_page_id(), 1);
        assert_eq!(store.create(1).unwrap().id(), 1);
        assert_eq!(store.create(1).unwrap().id(), 2);
        assert_eq!(store.next_page_id(), 3);
        assert_eq!(store.new_page_count(), 2);
    }

    #[test]
    fn retrieve_returns_same_page_object_until_commit() {
        let backend = MemoryBackend::new();
        let cache = fresh_cache();
        let store = open_mem(&backend, &cache, "/db/a", StoreOptions::synchronous()).unwrap();

        let created = store.create(1).unwrap();
        let retrieved = store.retrieve(1).unwrap();

        assert!(Arc::ptr_eq(&created, &retrieved));
    }

    #[test]
    fn write_to_unreserved_page_fails() {
        let backend = MemoryBackend::new();
        let cache = fresh_cache();
        let store = open_mem(&backend, &cache, "/db/a", StoreOptions::synchronous()).unwrap();

        let result = store.write(1, 1, &[0xAA], 0, 0, None);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("unreserved"));
    }

    #[test]
    fn write_to_committed_page_fails() {
        let backend = MemoryBackend::new();
        let cache = fresh_cache();
        let store = open_mem(&backend, &cache, "/db/a", StoreOptions::synchronous()).unwrap();

        store.create(1).unwrap();
        store.commit(1).unwrap();

        let result = store.write(2, 1, &[0xAA], 0, 0, None);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("fixed page"));
    }

    #[test]
    fn readonly_store_rejects_mutations() {
        let backend = MemoryBackend::new();
        let cache = fresh_cache();
        {
            let store = open_mem(&backend, &cache, "/db/a", StoreOptions::synchronous()).unwrap();
            store.create(1).unwrap();
            store.commit(1).unwrap();
        }

        let store = open_mem(&backend, &cache, "/db/a", StoreOptions::readonly()).unwrap();
        assert!(store.can_read());
        assert!(!store.can_write());

        assert!(store.create(2).is_err());
        assert!(store.write(2, 1, &[1], 0, 0, None).is_err());
        assert!(store.commit(2).is_err());
        assert!(store.retrieve(1).is_ok());
    }

    #[test]
    fn commit_with_no_new_pages_is_a_no_op() {
        let backend = MemoryBackend::new();
        let cache = fresh_cache();
        let store = open_mem(&backend, &cache, "/db/a", StoreOptions::synchronous()).unwrap();

        store.commit(1).unwrap();

        assert_eq!(store.next_page_id(), 1);
        assert_eq!(backend.file_len(Path::new("/db/a")), Some(0));
        assert!(cache.is_empty());
    }

    #[test]
    fn commit_advances_offsets_and_empties_buffer() {
        let backend = MemoryBackend::new();
        let cache = fresh_cache();
        let store = open_mem(&backend, &cache, "/db/a", StoreOptions::synchronous()).unwrap();

        store.create(7).unwrap();
        store.create(7).unwrap();
        store.write(7, 1, &[0xAA; 4], 0, 0, None).unwrap();
        store.write(7, 2, &[0xBB; 4], 0, 0, None).unwrap();
        store.commit(7).unwrap();

        assert_eq!(store.next_page_id(), 3);
        assert_eq!(store.new_page_count(), 0);
        assert_eq!(
            backend.file_len(Path::new("/db/a")),
            Some(2 * DEFAULT_PAGE_SIZE as u64)
        );

        assert_eq!(store.retrieve(1).unwrap().data()[0], 0xAA);
        assert_eq!(store.retrieve(2).unwrap().data()[0], 0xBB);
    }

    #[test]
    fn is_writable_tracks_commit_boundary() {
        let backend = MemoryBackend::new();
        let cache = fresh_cache();
        let store = open_mem(&backend, &cache, "/db/a", StoreOptions::synchronous()).unwrap();

        let page = store.create(1).unwrap();
        assert!(store.is_writable(&page));

        store.commit(1).unwrap();
        assert!(!store.is_writable(&page));
    }

    #[test]
    fn get_writable_page_copies_committed_bytes() {
        let backend = MemoryBackend::new();
        let cache = fresh_cache();
        let store = open_mem(&backend, &cache, "/db/a", StoreOptions::synchronous()).unwrap();

        let original = store.create(1).unwrap();
        store.write(1, 1, &[0x42; 8], 0, 0, None).unwrap();
        store.commit(1).unwrap();

        let committed = store.retrieve(1).unwrap();
        let copy = store.get_writable_page(2, &committed).unwrap();

        assert_ne!(copy.id(), committed.id());
        assert!(store.is_writable(&copy));
        assert_eq!(&copy.data()[..8], &[0x42; 8]);

        // A still-writable page is returned as-is.
        let again = store.get_writable_page(2, &copy).unwrap();
        assert!(Arc::ptr_eq(&again, &copy));
        drop(original);
    }

    #[test]
    fn close_disposes_the_store() {
        let backend = MemoryBackend::new();
        let cache = fresh_cache();
        let store = open_mem(&backend, &cache, "/db/a", StoreOptions::default()).unwrap();

        store.create(1).unwrap();
        store.close().unwrap();
        store.close().unwrap();

        assert!(!store.can_read());
        assert!(!store.can_write());

        let result = store.retrieve(1);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("disposed"));
        assert!(store.create(1).is_err());
        assert!(store.commit(1).is_err());
    }

    #[test]
    fn retrieve_rejects_page_id_zero() {
        let backend = MemoryBackend::new();
        let cache = fresh_cache();
        let store = open_mem(&backend, &cache, "/db/a", StoreOptions::default()).unwrap();

        assert!(store.retrieve(0).is_err());
    }
}
