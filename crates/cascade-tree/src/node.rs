//! Tree nodes and their action state machine.

use crate::tree::TreeCore;
use cascade_buffer::Buffer;
use cascade_common::{CascadeError, Record, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Pipeline action a node is currently queued for.
///
/// Valid transitions: `None → Sort → (root swap) → Empty → None` for
/// root-level buffers, `None → Merge → Empty → None` for internal nodes
/// receiving a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    None,
    Sort,
    Merge,
    Empty,
}

/// One node of the buffer tree: a bounded buffer plus child links.
///
/// `separator` is the inclusive upper bound on hashes admissible in the
/// subtree rooted here; a node's children are ordered by strictly
/// ascending separators and the last child's separator equals the node's
/// own. Leaves have no children; the root has no parent.
#[derive(Debug)]
pub(crate) struct Node {
    id: u32,
    /// Level in the tree; 0 at leaves, increasing toward the root.
    level: u32,
    separator: AtomicU32,
    buffer: Mutex<Buffer>,
    children: Mutex<Vec<Arc<Node>>>,
    parent: Mutex<Weak<Node>>,
    status: Mutex<Action>,
    merge_done: Condvar,
    empty_done: Condvar,
}

impl Node {
    pub(crate) fn new(id: u32, level: u32, capacity: usize, threshold: usize) -> Result<Self> {
        Ok(Self {
            id,
            level,
            separator: AtomicU32::new(u32::MAX),
            buffer: Mutex::new(Buffer::new(capacity, threshold)?),
            children: Mutex::new(Vec::new()),
            parent: Mutex::new(Weak::new()),
            status: Mutex::new(Action::None),
            merge_done: Condvar::new(),
            empty_done: Condvar::new(),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub(crate) fn level(&self) -> u32 {
        self.level
    }

    #[inline]
    pub(crate) fn separator(&self) -> u32 {
        self.separator.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_separator(&self, separator: u32) {
        self.separator.store(separator, Ordering::Release);
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.children.lock().is_empty()
    }

    pub(crate) fn is_root(&self) -> bool {
        self.parent.lock().upgrade().is_none()
    }

    pub(crate) fn parent(&self) -> Option<Arc<Node>> {
        self.parent.lock().upgrade()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buffer.lock().is_full()
    }

    pub(crate) fn buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock()
    }

    pub(crate) fn children_snapshot(&self) -> Vec<Arc<Node>> {
        self.children.lock().clone()
    }

    pub(crate) fn status(&self) -> Action {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, action: Action) {
        *self.status.lock() = action;
    }

    /// Appends one record to this node's buffer. Precondition: not full.
    pub(crate) fn insert(&self, record: Record) -> Result<()> {
        self.buffer.lock().append(record)
    }

    /// Marks the node for `action` and hands it to the matching pool.
    pub(crate) fn schedule(self: &Arc<Self>, action: Action, tree: &TreeCore) {
        self.set_status(action);
        trace!(node = self.id, level = self.level, action = ?action, "node scheduled");
        match action {
            Action::Sort => tree.sorter().add_node(self.clone()),
            Action::Merge => tree.merger().add_node(self.clone()),
            Action::Empty => tree.emptier().add_node(self.clone()),
            Action::None => unreachable!("cannot schedule NONE"),
        }
    }

    /// Blocks until the node is no longer queued for `action`.
    ///
    /// Idempotent: returns immediately when no such action is pending.
    pub(crate) fn wait(&self, action: Action) {
        match action {
            Action::Merge => {
                let mut status = self.status.lock();
                while *status == Action::Merge {
                    self.merge_done.wait(&mut status);
                }
            }
            Action::Empty => {
                let mut status = self.status.lock();
                while *status == Action::Empty {
                    self.empty_done.wait(&mut status);
                }
            }
            Action::Sort | Action::None => {}
        }
    }

    /// Signals completion of `action` to any waiter.
    pub(crate) fn done(&self, action: Action) {
        let _status = self.status.lock();
        match action {
            Action::Merge => {
                self.merge_done.notify_all();
            }
            Action::Empty => {
                self.empty_done.notify_all();
            }
            Action::Sort | Action::None => {}
        }
    }

    /// Schedules this node for a merge (sort + aggregate, then empty)
    /// iff its buffer is full, or unconditionally while the tree is
    /// flushing toward the leaves.
    pub(crate) fn empty_if_necessary(self: &Arc<Self>, tree: &TreeCore) -> Result<()> {
        if tree.flush_mode() || self.is_full() {
            self.schedule(Action::Merge, tree);
        }
        Ok(())
    }

    /// Copies a run of `len` elements starting at `start` from `src`
    /// into this node's buffer.
    fn receive_run(&self, src: &Buffer, start: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.buffer
            .lock()
            .extend_from_run(&src.hashes()[start..start + len], &src.records()[start..start + len])
    }

    /// Partitions this node's sorted, aggregated buffer among its
    /// children.
    ///
    /// Leaves are queued on the tree's pending-split list instead (split
    /// handling runs after the partition pass, so the topology seen by an
    /// in-flight partition stays fixed). Children receive their full run
    /// before they can be scheduled, so the snapshot taken here cannot
    /// race with a child splitting mid-scan.
    pub(crate) fn empty_buffer(self: &Arc<Self>, tree: &Arc<TreeCore>) -> Result<()> {
        if self.is_leaf() {
            if self.is_full() || self.is_root() {
                trace!(node = self.id, "leaf queued for split handling");
                tree.queue_leaf_for_split(self.clone());
            }
            return Ok(());
        }

        let children = self.children_snapshot();
        {
            let mut buf = self.buffer.lock();
            if buf.is_empty() {
                drop(buf);
                for child in &children {
                    child.empty_if_necessary(tree)?;
                }
            } else {
                let num = buf.len();
                let mut cur_child = 0usize;
                let mut last = 0usize;
                let mut cur = 0usize;
                while cur < num {
                    if buf.hashes()[cur] > children[cur_child].separator() {
                        // Flush the pending run into the child we are
                        // leaving, then skip every child whose separator
                        // lies below the current hash.
                        if cur > last {
                            children[cur_child].receive_run(&buf, last, cur - last)?;
                            last = cur;
                        }
                        while buf.hashes()[cur] > children[cur_child].separator() {
                            children[cur_child].empty_if_necessary(tree)?;
                            cur_child += 1;
                            if cur_child >= children.len() {
                                return Err(CascadeError::invariant(format!(
                                    "node {}: no child admits hash {:#010x}",
                                    self.id,
                                    buf.hashes()[cur]
                                )));
                            }
                        }
                    }
                    cur += 1;
                }

                // Final run, then any children that follow it.
                children[cur_child].receive_run(&buf, last, num - last)?;
                children[cur_child].empty_if_necessary(tree)?;
                cur_child += 1;
                while cur_child < children.len() {
                    children[cur_child].empty_if_necessary(tree)?;
                    cur_child += 1;
                }

                // The root keeps steady-state capacity; everyone else
                // releases storage until the next partition reaches them.
                if self.is_root() {
                    buf.clear();
                } else {
                    buf.deallocate();
                }
            }
        }

        // Earlier splits may have pushed this node past the fanout bound.
        if self.children.lock().len() > tree.config().fanout {
            self.split_non_leaf(tree)?;
        }
        Ok(())
    }

    /// Inserts `child` into this node's child list, ordered by separator,
    /// and re-parents it here.
    pub(crate) fn add_child(self: &Arc<Self>, child: Arc<Node>) {
        let mut children = self.children.lock();
        let separator = child.separator();
        let pos = children
            .iter()
            .position(|c| separator <= c.separator())
            .unwrap_or(children.len());
        trace!(
            node = self.id,
            child = child.id,
            pos,
            "child attached"
        );
        *child.parent.lock() = Arc::downgrade(self);
        children.insert(pos, child);
    }

    /// Splits a leaf around its median hash, never inside an equal-hash
    /// run. The new leaf takes the upper half and inherits the old
    /// separator; this leaf keeps the lower half and bounds itself by the
    /// last hash it retains. Returns the new leaf.
    pub(crate) fn split_leaf(self: &Arc<Self>, tree: &Arc<TreeCore>) -> Result<Arc<Node>> {
        let new_leaf = {
            let mut buf = self.buffer.lock();
            let num = buf.len();
            if num < 2 {
                return Err(CascadeError::invariant(format!(
                    "leaf {} with {} elements cannot split",
                    self.id, num
                )));
            }
            let mut split = num / 2;
            while split < num && buf.hashes()[split] == buf.hashes()[split - 1] {
                split += 1;
            }
            if split == num {
                return Err(CascadeError::invariant(format!(
                    "leaf {}: upper half is a single hash run",
                    self.id
                )));
            }

            let new_leaf = tree.new_node(0)?;
            new_leaf
                .buffer
                .lock()
                .extend_from_run(&buf.hashes()[split..], &buf.records()[split..])?;
            new_leaf.set_separator(self.separator());
            self.set_separator(buf.hashes()[split - 1]);
            buf.truncate(split);

            debug!(
                node = self.id,
                sibling = new_leaf.id,
                left = split,
                right = new_leaf.buffer.lock().len(),
                left_sep = self.separator(),
                right_sep = new_leaf.separator(),
                "leaf split"
            );
            new_leaf
        };

        tree.count_leaf_split();
        if self.is_root() {
            tree.promote_root(new_leaf.clone())?;
        } else {
            let parent = self.parent().ok_or_else(|| {
                CascadeError::invariant(format!("leaf {} lost its parent during split", self.id))
            })?;
            parent.add_child(new_leaf.clone());
        }
        Ok(new_leaf)
    }

    /// Splits a non-leaf by moving the upper half of its children to a
    /// new sibling at the same level. Precondition: the buffer is empty.
    pub(crate) fn split_non_leaf(self: &Arc<Self>, tree: &Arc<TreeCore>) -> Result<()> {
        debug_assert!(self.buffer.lock().is_empty());

        let sibling = tree.new_node(self.level)?;
        {
            let mut children = self.children.lock();
            let split_at = (children.len() + 1) / 2;
            let moved: Vec<Arc<Node>> = children.drain(split_at..).collect();
            {
                let mut sibling_children = sibling.children.lock();
                for child in moved {
                    *child.parent.lock() = Arc::downgrade(&sibling);
                    sibling_children.push(child);
                }
            }
            sibling.set_separator(self.separator());
            let last = children
                .last()
                .ok_or_else(|| CascadeError::invariant("split left node with no children"))?;
            self.set_separator(last.separator());
        }

        debug!(
            node = self.id,
            sibling = sibling.id,
            left_sep = self.separator(),
            right_sep = sibling.separator(),
            "non-leaf split"
        );

        tree.count_non_leaf_split();
        if self.is_root() {
            // Former root gives up its steady-state buffer; the fresh
            // root allocates its own.
            self.buffer.lock().deallocate();
            tree.promote_root(sibling)?;
        } else {
            let parent = self.parent().ok_or_else(|| {
                CascadeError::invariant(format!("node {} lost its parent during split", self.id))
            })?;
            parent.add_child(sibling);
        }
        Ok(())
    }
}
