//! # Persistence Backend Abstraction
//!
//! This module provides the `PersistenceBackend` trait, the minimal capability
//! set the page store needs from a host filesystem: existence checks, file
//! creation, and seekable read/write streams.
//!
//! ## Design Philosophy
//!
//! The store never touches `std::fs` directly. Routing all file access through
//! a backend keeps the core portable to hosts without a POSIX filesystem and
//! lets the test suite run against an in-memory backend with no tempdir
//! bookkeeping.
//!
//! Streams are copy-based and seekable rather than memory-mapped: every page
//! read and write is positional (seek then transfer), which is the access
//! pattern the append-only store relies on.
//!
//! ## Backends
//!
//! | Backend         | Host          | Durability                |
//! |-----------------|---------------|---------------------------|
//! | `FsBackend`     | native        | `File::sync_data`         |
//! | `MemoryBackend` | any (testing) | none, process lifetime    |
//!
//! ## Append Mode Caveat
//!
//! `OpenMode::Append` positions the stream at end-of-file; it does not pin
//! writes there. Opening with the OS-level append flag would make the kernel
//! ignore seeks on every write, which breaks positional page writes, so the
//! filesystem backend deliberately avoids it.
//!
//! ## Thread Safety
//!
//! Backends are `Send + Sync` and may be shared across stores. The streams
//! they hand out are `Send` but not `Sync`; each stream has a single owner
//! (the store's reader slot or a background writer's sink).

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;

/// Seekable input stream for page loads.
pub trait PageSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> PageSource for T {}

/// Seekable output stream for page writes.
///
/// `sync` is the durability point: after it returns, every byte written to
/// the stream must survive a process crash (for backends that can promise
/// that at all).
pub trait PageSink: Write + Seek + Send {
    fn sync(&mut self) -> Result<()>;
}

/// How an output stream should be positioned on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open positioned at end-of-file.
    Append,
    /// Open positioned at the start of the file.
    Open,
}

/// Minimal filesystem capability set used by the page store.
pub trait PersistenceBackend: Send + Sync {
    /// Returns true if a file exists at `path`.
    fn file_exists(&self, path: &Path) -> bool;

    /// Creates an empty file at `path` if one does not already exist.
    /// Existing content is left untouched.
    fn create_file(&self, path: &Path) -> Result<()>;

    /// Opens the file at `path` for seekable reads.
    fn open_for_read(&self, path: &Path) -> Result<Box<dyn PageSource>>;

    /// Opens the file at `path` for seekable writes without truncation.
    fn open_for_write(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn PageSink>>;
}

/// Production backend over `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsBackend;

impl PageSink for std::fs::File {
    fn sync(&mut self) -> Result<()> {
        self.sync_data().wrap_err("failed to sync page file to disk")
    }
}

impl PersistenceBackend for FsBackend {
    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_file(&self, path: &Path) -> Result<()> {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create page file '{}'", path.display()))?;
        Ok(())
    }

    fn open_for_read(&self, path: &Path) -> Result<Box<dyn PageSource>> {
        let file = std::fs::File::open(path)
            .wrap_err_with(|| format!("failed to open page file '{}' for reading", path.display()))?;
        Ok(Box::new(file))
    }

    fn open_for_write(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn PageSink>> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open page file '{}' for writing", path.display()))?;

        if mode == OpenMode::Append {
            // Position only. O_APPEND would make the kernel ignore seeks.
            file.seek(SeekFrom::End(0))
                .wrap_err_with(|| format!("failed to seek to end of '{}'", path.display()))?;
        }

        Ok(Box::new(file))
    }
}

type SharedFile = Arc<RwLock<Vec<u8>>>;

/// In-memory backend for tests and hosts without a filesystem.
///
/// Clones share the same file map, so a store and the test driving it can
/// observe the same bytes.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    files: Arc<RwLock<HashMap<PathBuf, SharedFile>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current length of the file at `path`, if it exists.
    pub fn file_len(&self, path: &Path) -> Option<u64> {
        let files = self.files.read();
        files.get(path).map(|f| f.read().len() as u64)
    }
}

impl PersistenceBackend for MemoryBackend {
    fn file_exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }

    fn create_file(&self, path: &Path) -> Result<()> {
        let mut files = self.files.write();
        files
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(Vec::new())));
        Ok(())
    }

    fn open_for_read(&self, path: &Path) -> Result<Box<dyn PageSource>> {
        let files = self.files.read();
        let file = files.get(path).ok_or_else(|| {
            eyre::eyre!("in-memory file '{}' does not exist", path.display())
        })?;
        Ok(Box::new(MemoryStream {
            file: Arc::clone(file),
            pos: 0,
        }))
    }

    fn open_for_write(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn PageSink>> {
        let files = self.files.read();
        let file = files.get(path).ok_or_else(|| {
            eyre::eyre!("in-memory file '{}' does not exist", path.display())
        })?;
        let pos = match mode {
            OpenMode::Append => file.read().len() as u64,
            OpenMode::Open => 0,
        };
        Ok(Box::new(MemoryStream {
            file: Arc::clone(file),
            pos,
        }))
    }
}

/// Seekable cursor over a shared in-memory file.
struct MemoryStream {
    file: SharedFile,
    pos: u64,
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let data = self.file.read();
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut data = self.file.write();
        let start = self.pos as usize;
        if data.len() < start + buf.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let len = self.file.read().len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => len + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of in-memory file",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

impl PageSink for MemoryStream {
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl PageSink for std::io::Cursor<Vec<u8>> {
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}
