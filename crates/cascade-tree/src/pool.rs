//! Worker pools: the sort / merge / empty pipeline stages.
//!
//! Each pool owns a fixed number of OS threads and a queue of nodes.
//! Sorter and merger queues are plain level-keyed priority heaps; the
//! emptier queue is the [`PriorityDag`], which holds a parent back until
//! every child that was pending at enqueue time has finished. A worker
//! that finds its queue empty decrements the tree-wide awake counter and
//! sleeps on the pool condvar; the counter is what flush and drain poll
//! to detect pipeline quiescence.

use crate::dag::PriorityDag;
use crate::node::{Action, Node};
use crate::tree::TreeCore;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread;
use tracing::trace;

pub(crate) struct LevelEntry {
    level: u32,
    seq: u64,
    node: Arc<Node>,
}

impl PartialEq for LevelEntry {
    fn eq(&self, other: &Self) -> bool {
        self.level == other.level && self.seq == other.seq
    }
}

impl Eq for LevelEntry {}

impl PartialOrd for LevelEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LevelEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.level
            .cmp(&other.level)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) enum WorkQueue {
    Level { heap: BinaryHeap<LevelEntry>, seq: u64 },
    Dag(PriorityDag),
}

impl WorkQueue {
    pub(crate) fn level() -> Self {
        WorkQueue::Level {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub(crate) fn dag() -> Self {
        WorkQueue::Dag(PriorityDag::default())
    }

    fn push(&mut self, node: Arc<Node>) {
        match self {
            WorkQueue::Level { heap, seq } => {
                heap.push(LevelEntry {
                    level: node.level(),
                    seq: *seq,
                    node,
                });
                *seq += 1;
            }
            WorkQueue::Dag(dag) => {
                dag.insert(node);
            }
        }
    }

    fn pop(&mut self) -> Option<Arc<Node>> {
        match self {
            WorkQueue::Level { heap, .. } => heap.pop().map(|entry| entry.node),
            WorkQueue::Dag(dag) => dag.pop(),
        }
    }

    fn is_drained(&self) -> bool {
        match self {
            WorkQueue::Level { heap, .. } => heap.is_empty(),
            WorkQueue::Dag(dag) => dag.is_empty(),
        }
    }
}

struct PoolState {
    queue: WorkQueue,
    input_complete: bool,
}

/// One worker pool: queue state, the has-work condvar, and thread handles.
pub(crate) struct Pool {
    name: &'static str,
    state: Mutex<PoolState>,
    has_work: Condvar,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Pool {
    pub(crate) fn new(name: &'static str, queue: WorkQueue) -> Self {
        Self {
            name,
            state: Mutex::new(PoolState {
                queue,
                input_complete: false,
            }),
            has_work: Condvar::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Enqueues a node and wakes one sleeping worker.
    pub(crate) fn add_node(&self, node: Arc<Node>) {
        {
            let mut state = self.state.lock();
            state.queue.push(node);
        }
        self.has_work.notify_one();
    }

    /// Reports a finished empty to the DAG so a blocked parent can be
    /// enabled, then nudges a worker to pick it up.
    pub(crate) fn post_completed(&self, node: &Arc<Node>) {
        {
            let mut state = self.state.lock();
            if let WorkQueue::Dag(dag) = &mut state.queue {
                dag.post(node);
            }
        }
        self.has_work.notify_one();
    }

    /// True when the queue holds no work at all (for the emptier this
    /// includes disabled nodes).
    pub(crate) fn is_drained(&self) -> bool {
        self.state.lock().queue.is_drained()
    }

    /// Asks every worker to exit once woken.
    pub(crate) fn shutdown(&self) {
        self.state.lock().input_complete = true;
        self.has_work.notify_all();
    }

    /// Joins all worker threads.
    pub(crate) fn join_all(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Pipeline stage identifier, used for thread naming and dispatch.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Stage {
    Sorter,
    Merger,
    Emptier,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Sorter => "sorter",
            Stage::Merger => "merger",
            Stage::Emptier => "emptier",
        }
    }
}

/// Spawns `count` workers for `stage`, registering their handles with the
/// stage's pool.
pub(crate) fn spawn_workers(tree: &Arc<TreeCore>, stage: Stage, count: usize) -> cascade_common::Result<()> {
    let pool = tree.pool(stage);
    let mut handles = pool.handles.lock();
    for index in 0..count {
        let tree = tree.clone();
        let handle = thread::Builder::new()
            .name(format!("cascade-{}-{}", stage.name(), index))
            .spawn(move || worker_loop(tree, stage))
            .map_err(|e| {
                cascade_common::CascadeError::Internal(format!("failed to spawn worker: {e}"))
            })?;
        handles.push(handle);
    }
    Ok(())
}

fn worker_loop(tree: Arc<TreeCore>, stage: Stage) {
    let pool = tree.pool(stage);
    loop {
        let node = {
            let mut state = pool.state.lock();
            loop {
                if state.input_complete {
                    return;
                }
                if let Some(node) = state.queue.pop() {
                    break node;
                }
                // Sleep protocol: the awake counter must drop before the
                // wait begins so quiescence polling never undercounts
                // in-flight work.
                tree.worker_asleep();
                pool.has_work.wait(&mut state);
                tree.worker_awake();
            }
        };

        trace!(
            pool = pool.name,
            node = node.id(),
            size = node.buffer().len(),
            "worker picked node"
        );
        let result = match stage {
            Stage::Sorter => sorter_work(&tree, node),
            Stage::Merger => merger_work(&tree, node),
            Stage::Emptier => emptier_work(&tree, node),
        };
        if let Err(err) = result {
            tree.record_failure(err);
        }
    }
}

/// Sorter stage: sort + aggregate a root-level buffer, then hand it to
/// the rotation protocol.
fn sorter_work(tree: &Arc<TreeCore>, node: Arc<Node>) -> cascade_common::Result<()> {
    debug_assert_eq!(node.status(), Action::Sort);
    {
        let mut buffer = node.buffer();
        tree.sort_buffer(&mut buffer)?;
        buffer.aggregate()?;
    }
    tree.add_to_sorted(node);
    Ok(())
}

/// Merger stage: sort + aggregate an internal node that just received a
/// partition, then queue it for emptying.
fn merger_work(tree: &Arc<TreeCore>, node: Arc<Node>) -> cascade_common::Result<()> {
    debug_assert_eq!(node.status(), Action::Merge);
    {
        let mut buffer = node.buffer();
        tree.sort_buffer(&mut buffer)?;
        buffer.aggregate()?;
    }
    node.schedule(Action::Empty, tree);
    node.done(Action::Merge);
    Ok(())
}

/// Emptier stage: partition a node's buffer among its children; leaves
/// then get their deferred splits; a finished root pulls the next sorted
/// buffer into rotation.
fn emptier_work(tree: &Arc<TreeCore>, node: Arc<Node>) -> cascade_common::Result<()> {
    node.wait(Action::Merge);
    debug_assert_eq!(node.status(), Action::Empty);

    // Snapshot before performing: a split below can promote a new root,
    // and nothing may post for the old root afterwards.
    let was_root = node.is_root();

    let result = node.empty_buffer(tree).and_then(|()| {
        if node.is_leaf() {
            tree.handle_full_leaves()
        } else {
            Ok(())
        }
    });

    node.set_status(Action::None);
    if was_root {
        tree.submit_next_for_emptying();
    } else {
        tree.emptier().post_completed(&node);
    }
    node.done(Action::Empty);
    result
}
