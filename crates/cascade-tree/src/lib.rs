//! Compressed buffer tree: an in-memory write-optimized aggregation index.
//!
//! Clients stream `(hash, key, value)` records in; the tree groups them
//! by key, reduces values with the record merge operator, and on drain
//! yields a sorted, fully-aggregated output stream.
//!
//! ```text
//! ingest → [input root buffer] ─full─→ Sorter (sort + aggregate)
//!                ↑ fresh root                 │ root swap
//!            [root pool] ←────────────────────┘
//!                                       Emptier (partition to children)
//!                                             │ child overflows
//!                                       Merger (sort + aggregate child)
//!                                             │
//!                                       Emptier ... down to the leaves
//! ```
//!
//! Three fixed worker pools drive the pipeline. A priority DAG keeps a
//! parent's empty from starting while any of its children is still
//! mid-action, so each buffer has a single writer at any instant. Drain
//! flushes every buffer to the leaves and walks them left to right.

mod dag;
mod node;
mod pool;
mod tree;

pub use tree::{CascadeTree, TreeStats};
