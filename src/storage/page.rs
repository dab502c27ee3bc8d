//! # Page Type
//!
//! A page is a fixed-size byte buffer identified by a 1-based integer id.
//! Page `n` occupies bytes `[(n - 1) * page_size, n * page_size)` of its
//! file; there is no header, footer, or inter-page metadata, and the content
//! is opaque to this layer.
//!
//! ## Lifecycle
//!
//! A page is either *loaded* (read from the file, immutable by contract) or
//! *new* (allocated by a writable store, mutable until commit). After commit
//! a new page is observationally identical to a loaded one.
//!
//! ## Sharing
//!
//! Pages are shared as `Arc<Page>` between the owning store, the shared page
//! cache, and the background writer. The buffer sits behind a `RwLock` so the
//! writer thread re-reads the current bytes at dequeue time: when the same
//! page is queued more than once, the last write for its id defines the
//! on-disk bytes. The dirty flag and the committed-transaction stamp are
//! atomics so they can be updated without touching the buffer lock.

use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use parking_lot::{RwLock, RwLockReadGuard};

use super::backend::{PageSink, PageSource};

pub struct Page {
    id: u64,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
    committed_transaction: AtomicU64,
}

impl Page {
    /// Allocates a zero-filled page. New pages start clean; the first
    /// `set_data` marks them dirty.
    pub fn new_empty(id: u64, page_size: u32) -> Self {
        Self {
            id,
            data: RwLock::new(vec![0u8; page_size as usize].into_boxed_slice()),
            dirty: AtomicBool::new(false),
            committed_transaction: AtomicU64::new(0),
        }
    }

    /// Reads exactly `page_size` bytes from the page's offset in `source`.
    pub fn new_loaded(source: &mut dyn PageSource, id: u64, page_size: u32) -> Result<Self> {
        let offset = (id - 1) * page_size as u64;
        source
            .seek(SeekFrom::Start(offset))
            .wrap_err_with(|| format!("failed to seek to page {} at offset {}", id, offset))?;

        let mut buf = vec![0u8; page_size as usize];
        source
            .read_exact(&mut buf)
            .wrap_err_with(|| format!("failed to read page {} at offset {}", id, offset))?;

        Ok(Self {
            id,
            data: RwLock::new(buf.into_boxed_slice()),
            dirty: AtomicBool::new(false),
            committed_transaction: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn page_size(&self) -> u32 {
        self.data.read().len() as u32
    }

    /// Read access to the page bytes. The guard blocks concurrent writes
    /// for its lifetime; keep it short.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Copies `len` bytes from `src[src_offset..]` into the buffer at
    /// `page_offset` and marks the page dirty. `len = None` copies from
    /// `src_offset` to the end of `src`.
    pub fn set_data(
        &self,
        src: &[u8],
        src_offset: usize,
        page_offset: usize,
        len: Option<usize>,
    ) -> Result<()> {
        ensure!(
            src_offset <= src.len(),
            "source offset {} exceeds source length {}",
            src_offset,
            src.len()
        );
        let count = len.unwrap_or(src.len() - src_offset);
        ensure!(
            src_offset + count <= src.len(),
            "source range {}..{} exceeds source length {}",
            src_offset,
            src_offset + count,
            src.len()
        );

        let mut data = self.data.write();
        ensure!(
            page_offset + count <= data.len(),
            "page range {}..{} exceeds page size {} on page {}",
            page_offset,
            page_offset + count,
            data.len(),
            self.id
        );

        data[page_offset..page_offset + count].copy_from_slice(&src[src_offset..src_offset + count]);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Writes the buffer at the page's offset in `sink`, records `txn_id`,
    /// and clears the dirty flag. Writes are positional: pages are not
    /// necessarily written in id order.
    pub fn write(&self, sink: &mut dyn PageSink, txn_id: u64) -> Result<()> {
        let data = self.data.read();
        let offset = (self.id - 1) * data.len() as u64;

        sink.seek(SeekFrom::Start(offset))
            .wrap_err_with(|| format!("failed to seek to page {} at offset {}", self.id, offset))?;
        sink.write_all(&data)
            .wrap_err_with(|| format!("failed to write page {} at offset {}", self.id, offset))?;

        self.committed_transaction.store(txn_id, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Transaction id recorded by the last `write`, 0 until then.
    pub fn committed_transaction(&self) -> u64 {
        self.committed_transaction.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("page_size", &self.data.read().len())
            .field("dirty", &self.is_dirty())
            .field("committed_transaction", &self.committed_transaction())
            .finish()
    }
}
