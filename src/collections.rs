//! Hash collections used by the planning engines.
//!
//! With the `gxhash` feature the maps use gxhash's AES-backed hasher, which is
//! noticeably faster for the path and distance keys the BK-tree and grouper
//! hash millions of times. Without it (CPUs lacking AES-NI/SSE2, docs.rs) the
//! std hasher is used. Pre-sized maps go through [`map_with_capacity`] so no
//! call site depends on the hasher type.

#[cfg(feature = "gxhash")]
pub use gxhash::HashMap;

#[cfg(not(feature = "gxhash"))]
pub use std::collections::HashMap;

/// Map pre-sized for `capacity` entries
#[cfg(feature = "gxhash")]
pub fn map_with_capacity<K, V>(capacity: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(capacity, gxhash::GxBuildHasher::default())
}

/// Map pre-sized for `capacity` entries
#[cfg(not(feature = "gxhash"))]
pub fn map_with_capacity<K, V>(capacity: usize) -> HashMap<K, V> {
    HashMap::with_capacity(capacity)
}

/// Hasher builder for maps not built through [`map_with_capacity`]
#[cfg(feature = "gxhash")]
pub type BuildHasher = gxhash::GxBuildHasher;

/// Hasher builder for maps not built through [`map_with_capacity`]
#[cfg(not(feature = "gxhash"))]
pub type BuildHasher = std::collections::hash_map::RandomState;
