//! Geographic range index for SOSI groups.
//!
//! One leaf per group with geometry, owned by the tree and referenced from the
//! group table by handle.

mod rtree;

pub use rtree::{GeoTree, LeafHandle, Query, MAX_CHILDREN};
