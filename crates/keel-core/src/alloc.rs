//! Optimized collection types for Keel.
//!
//! This module provides:
//! - Re-exports of hash collections using AHash
//! - An insertion-ordered map for tables that need stable iteration cursors

// Re-export optimized hash collections
pub use ahash::{AHashMap as HashMap, AHashSet as HashSet, RandomState};

/// Insertion-ordered map hashed with AHash.
///
/// Positions are stable until an entry is removed, which lets incremental passes
/// keep a cursor between calls.
pub type IndexMap<K, V> = indexmap::IndexMap<K, V, RandomState>;

/// Create an empty [`IndexMap`].
pub fn index_map<K, V>() -> IndexMap<K, V> {
    IndexMap::with_hasher(RandomState::new())
}
