//! # QuarryDB Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! The following diagram shows how constants relate to each other. When changing
//! any constant, check if dependent constants need adjustment.
//!
//! ```text
//! PAGE_SIZE_ALIGNMENT (4096 bytes)
//!       │
//!       └─> DEFAULT_PAGE_SIZE (must be a power-of-two multiple)
//!             Every store validates its page size against the alignment at
//!             open time; the default must pass the same check.
//!
//! CACHE_SHARD_COUNT (64)
//!       │
//!       └─> DEFAULT_CACHE_CAPACITY (must be >=, one entry per shard)
//!             PageCache::new rejects capacities below the shard count, so
//!             the default capacity has to clear it with room to spare.
//!
//! WRITER_QUEUE_HIGH_WATER (256)
//!       │
//!       └─> Submitters block once this many pages are queued. Must stay
//!           well below DEFAULT_CACHE_CAPACITY or eviction hand-offs could
//!           stall the cache behind a saturated writer.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `DEFAULT_PAGE_SIZE` is a power-of-two multiple of `PAGE_SIZE_ALIGNMENT`
//! 2. `DEFAULT_CACHE_CAPACITY >= CACHE_SHARD_COUNT`
//! 3. `WRITER_QUEUE_HIGH_WATER < DEFAULT_CACHE_CAPACITY`
//!
//! ## Usage
//!
//! Import constants from this module rather than defining them locally:
//!
//! ```ignore
//! use quarrydb::config::{DEFAULT_PAGE_SIZE, CACHE_SHARD_COUNT};
//! ```

// ============================================================================
// PAGE LAYOUT CONFIGURATION
// These define the fundamental unit of I/O shared by every component
// ============================================================================

/// Required alignment for page sizes in bytes.
/// A store's page size must be a positive power-of-two multiple of this value
/// so that file offsets can be derived by shifting.
pub const PAGE_SIZE_ALIGNMENT: u32 = 4096;

/// Default page size in bytes.
/// Used when `StoreOptions` does not override it. Typical values are
/// 4096, 8192, and 16384.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

const _: () = assert!(
    DEFAULT_PAGE_SIZE.is_power_of_two() && DEFAULT_PAGE_SIZE % PAGE_SIZE_ALIGNMENT == 0,
    "DEFAULT_PAGE_SIZE must be a power-of-two multiple of PAGE_SIZE_ALIGNMENT"
);

// ============================================================================
// PAGE CACHE CONFIGURATION
// These control contention and memory characteristics of the shared cache
// ============================================================================

/// Number of shards for the page cache.
/// Higher values reduce lock contention but increase per-cache overhead.
pub const CACHE_SHARD_COUNT: usize = 64;

/// Default total capacity of the shared page cache, in pages.
/// This is a soft cap: inserts whose evictions are all cancelled by
/// subscribers may exceed it transiently.
pub const DEFAULT_CACHE_CAPACITY: usize = 2048;

const _: () = assert!(
    DEFAULT_CACHE_CAPACITY >= CACHE_SHARD_COUNT,
    "DEFAULT_CACHE_CAPACITY must provide at least one entry per shard"
);

// ============================================================================
// BACKGROUND WRITER CONFIGURATION
// ============================================================================

/// High-water mark of the background writer's queue, in pages.
/// `queue_write` blocks once this many pages are pending, bounding the
/// memory retained between flushes.
pub const WRITER_QUEUE_HIGH_WATER: usize = 256;

const _: () = assert!(
    WRITER_QUEUE_HIGH_WATER < DEFAULT_CACHE_CAPACITY,
    "WRITER_QUEUE_HIGH_WATER must stay below DEFAULT_CACHE_CAPACITY"
);
