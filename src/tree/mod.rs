//! B+-tree layer: tree algorithms, leaf iterators and cursor registry.

mod iter;
mod registry;
mod tree;

pub use iter::LeafIterator;
pub use registry::{IterHandle, IteratorRegistry};
pub use tree::BTree;
