//! Priority DAG: the emptier pool's scheduling queue.
//!
//! A parent must not start emptying while any child that was already in
//! the pipeline at enqueue time is still mid-action: the partition step
//! writes into child buffers, so a child mid-empty would be written and
//! emptied at once. Nodes whose children are all idle sit in an enabled
//! priority queue (higher level first); the rest wait in a disabled map
//! keyed by the set of child ids still pending. Once enabled, a node is
//! never demoted: children only finish, never start, after their parent
//! is enqueued.

use crate::node::{Action, Node};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

struct DagEntry {
    level: u32,
    seq: u64,
    node: Arc<Node>,
}

impl PartialEq for DagEntry {
    fn eq(&self, other: &Self) -> bool {
        self.level == other.level && self.seq == other.seq
    }
}

impl Eq for DagEntry {}

impl PartialOrd for DagEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DagEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on level; FIFO among equals.
        self.level
            .cmp(&other.level)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(crate) struct PriorityDag {
    enabled: BinaryHeap<DagEntry>,
    disabled: HashMap<u32, (Arc<Node>, HashSet<u32>)>,
    seq: u64,
}

impl PriorityDag {
    fn push_enabled(&mut self, node: Arc<Node>) {
        self.enabled.push(DagEntry {
            level: node.level(),
            seq: self.seq,
            node,
        });
        self.seq += 1;
    }

    /// Inserts a node scheduled for emptying. Returns true if it is
    /// immediately enabled.
    pub(crate) fn insert(&mut self, node: Arc<Node>) -> bool {
        let mut pending = HashSet::new();
        for child in node.children_snapshot() {
            if child.status() != Action::None {
                pending.insert(child.id());
            }
        }
        trace!(
            node = node.id(),
            pending = pending.len(),
            "emptier queue insert"
        );
        if pending.is_empty() {
            self.push_enabled(node);
            true
        } else {
            self.disabled.insert(node.id(), (node, pending));
            false
        }
    }

    /// Pops the highest-priority enabled node, if any.
    pub(crate) fn pop(&mut self) -> Option<Arc<Node>> {
        self.enabled.pop().map(|entry| entry.node)
    }

    /// Records that `node` finished its empty; if its parent was waiting
    /// on it and has no other pending children, the parent is enabled.
    pub(crate) fn post(&mut self, node: &Arc<Node>) {
        let Some(parent) = node.parent() else {
            return;
        };
        if parent.status() != Action::Empty {
            return;
        }
        if let Some((_, pending)) = self.disabled.get_mut(&parent.id()) {
            pending.remove(&node.id());
            if pending.is_empty() {
                let (parent, _) = self
                    .disabled
                    .remove(&parent.id())
                    .expect("entry present: just mutated");
                trace!(node = parent.id(), "emptier dependency cleared");
                self.push_enabled(parent);
            }
        }
    }

    /// True when nothing is enabled or disabled.
    pub(crate) fn is_empty(&self) -> bool {
        self.enabled.is_empty() && self.disabled.is_empty()
    }
}
