//! # QuarryDB Configuration Module
//!
//! This module centralizes all configuration constants for the page store.
//! Constants are grouped by their functional area and interdependencies are
//! documented and enforced through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! Scattered constants across multiple files led to bugs where interdependent
//! values became mismatched. For example, `DEFAULT_CACHE_CAPACITY` must never
//! drop below `CACHE_SHARD_COUNT` or cache construction fails at runtime. By
//! co-locating these constants and adding compile-time checks, we prevent
//! such issues.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
