//! # QuarryDB Page Store
//!
//! QuarryDB's storage substrate: a durable, append-only, fixed-page-size
//! file store that serves as the on-disk foundation for a graph/triple
//! database. Higher layers (query translation, transactional indexes)
//! consume the [`AppendOnlyPageStore`] contract; this crate owns the triad
//! underneath it:
//!
//! - **Append-only identity semantics**: once committed, a page id maps to
//!   immutable bytes; updates allocate new pages. Readers never lock
//!   against writers.
//! - **A shared, process-wide page cache** with capacity-driven eviction
//!   that consults page owners before dropping anything.
//! - **A background writer** that pipelines disk writes ahead of commit,
//!   keeping commit latency down while preserving durability on commit
//!   boundaries.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use quarrydb::storage::{AppendOnlyPageStore, FsBackend, PageCache, StoreOptions};
//!
//! let store = AppendOnlyPageStore::open(
//!     Arc::new(FsBackend),
//!     Arc::clone(PageCache::shared()),
//!     "./graph.pages",
//!     StoreOptions::default(),
//! )?;
//!
//! let page = store.create(txn_id)?;
//! store.write(txn_id, page.id(), &payload, 0, 0, None)?;
//! store.commit(txn_id)?;
//! ```
//!
//! ## File Format
//!
//! A page file is the concatenation of fixed-size pages: page `n`
//! (1-based) occupies bytes `[(n-1) * page_size, n * page_size)`. There is
//! no header, footer, or inter-page metadata; page content is opaque to
//! this layer. The page size is a power-of-two multiple of 4096, fixed
//! per store.
//!
//! ## Module Overview
//!
//! - [`storage`]: page type, persistence backends, shared cache,
//!   background writer, and the append-only store
//! - [`config`]: centralized constants with compile-time invariant checks

pub mod config;
pub mod storage;

pub use storage::{
    AppendOnlyPageStore, BackgroundPageWriter, FsBackend, MemoryBackend, Page, PageCache,
    Partition, StoreOptions,
};
