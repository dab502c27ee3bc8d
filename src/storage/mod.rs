//! # Storage Module
//!
//! This module provides the foundational storage layer for QuarryDB: an
//! append-only store of fixed-size pages backed by a single file, the
//! process-wide page cache shared by every store, and the background
//! writer that pipelines disk writes ahead of commit.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            AppendOnlyPageStore               │
//! │  retrieve / create / write / commit          │
//! ├──────────────┬───────────────┬───────────────┤
//! │  new-page    │   PageCache   │  Background   │
//! │  buffer      │  (per-process)│  PageWriter   │
//! ├──────────────┴───────────────┴───────────────┤
//! │             PersistenceBackend               │
//! │        (filesystem / in-memory)              │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A write path: a client reserves a page from the store; the page lives
//! in the store's new-page buffer; writes mutate its bytes and queue it to
//! the background writer; commit flushes the writer and promotes the pages
//! into the shared cache as committed, immutable pages. A read path: the
//! store checks its new-page buffer, then the cache, then loads the page
//! from the file and caches it.
//!
//! ## Append-Only Semantics
//!
//! A committed page id maps to immutable bytes forever; modifications
//! allocate a new id (`get_writable_page`). This is what lets readers
//! observe pages without locking against writers, and what makes crash
//! behavior simple: the file is valid up to the last flush, and a partial
//! tail is abandoned on reopen.
//!
//! ## Eviction Cooperation
//!
//! The cache is global and sees pages from many stores, but only the
//! originating store knows whether a page is a dirty uncommitted one whose
//! loss would corrupt an in-progress commit. The cache therefore raises a
//! before-evict notification to the store owning the page's partition,
//! which either cancels the eviction or hands durability to its background
//! writer. See [`cache`] for the protocol.
//!
//! ## Module Organization
//!
//! - `backend`: `PersistenceBackend` trait with filesystem and in-memory
//!   implementations
//! - `page`: the `Page` type and its positional I/O
//! - `cache`: sharded second-chance cache with the before-evict protocol
//! - `writer`: single-consumer background write pipeline
//! - `store`: the `AppendOnlyPageStore` orchestration

mod backend;
mod cache;
mod page;
mod store;
mod writer;

pub use backend::{FsBackend, MemoryBackend, OpenMode, PageSink, PageSource, PersistenceBackend};
pub use cache::{CacheStats, EvictionListener, EvictionVerdict, PageCache, PageKey, Partition};
pub use page::Page;
pub use store::{AppendOnlyPageStore, StoreOptions};
pub use writer::{BackgroundPageWriter, WriterStats};
