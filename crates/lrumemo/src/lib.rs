//! # lrumemo
//!
//! Bounded memoization store with least-recently-used eviction.
//!
//! ## Architecture
//! - **HashMap**: AHash index from key to arena slot (O(1))
//! - **LRU List**: Doubly-linked list over arena slots for eviction (O(1))
//! - **Compute-on-miss**: `get_or_compute` looks up or computes and stores in one call
//!
//! ## Guarantees
//! - Never holds more than `capacity` entries
//! - A full store evicts the entry that has gone longest without a hit or insert
//! - A hit never re-runs the compute function
//!
//! The store is not synchronized. Wrap it in a lock to share it across threads.

#![warn(missing_docs)]

mod error;
mod lru;

pub use error::{Error, Result};
pub use lru::{Iter, LruStore};
