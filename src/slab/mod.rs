//! Slab pools for small object allocation.
//!
//! Each size class owns one pool. A pool carves page runs from the kmem arena
//! into equal objects; the per-slab bookkeeping lives in the arena's usage
//! table rather than in the slab pages themselves.

pub mod slab_node;
pub mod slab_pool;

// Re-export public types
pub use slab_node::SlabNode;
pub use slab_pool::{BucketStats, SlabPool};
