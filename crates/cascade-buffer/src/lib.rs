//! Bounded record buffers for the cascade engine.
//!
//! A buffer owns two parallel columns sized to a configured element cap:
//! the records and a redundant hash column that keeps the sort and
//! partition hot loops on dense `u32`s. The sort/aggregate pair is the
//! record-level primitive the whole pipeline is built on:
//!
//! ```text
//! append* → [unsorted buffer] → sort (by hash) → aggregate (merge keys)
//! ```
//!
//! Sorting may be delegated to a co-processor through [`SortOffload`];
//! the CPU path is always available as a fallback with identical
//! postconditions.

mod buffer;
mod offload;
mod sort;

pub use buffer::Buffer;
pub use offload::SortOffload;
