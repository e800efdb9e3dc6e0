//! The compressed buffer tree front door.
//!
//! `CascadeTree` is the single-owner handle the ingest thread drives;
//! `TreeCore` is the state shared with the worker pools. Ingest and drain
//! both take `&mut self`, so the forbidden drain-while-inserting overlap
//! is a compile error rather than a runtime race.

use crate::node::{Action, Node};
use crate::pool::{spawn_workers, Pool, Stage, WorkQueue};
use cascade_buffer::{Buffer, SortOffload};
use cascade_common::{CascadeError, Record, Result, TreeConfig};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// Diagnostic counters for a running engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Tree height: 1 for a lone root leaf.
    pub height: u32,
    /// Completed root rotations.
    pub rotations: u64,
    /// Completed leaf splits.
    pub leaf_splits: u64,
    /// Completed non-leaf splits.
    pub non_leaf_splits: u64,
}

/// State shared between the front door and the worker pools.
pub(crate) struct TreeCore {
    config: TreeConfig,
    node_ctr: AtomicU32,
    /// The current root. Replaced on promotion; its buffer is the target
    /// of every root rotation.
    root: Mutex<Arc<Node>>,
    /// Returned root-level nodes awaiting reuse as input buffers.
    empty_roots: Mutex<VecDeque<Arc<Node>>>,
    root_available: Condvar,
    /// Sorted root-level buffers queued behind an in-flight root empty.
    /// This lock is also the linearization point of the rotation
    /// protocol.
    sorted_nodes: Mutex<VecDeque<Arc<Node>>>,
    /// Leaves awaiting split handling after a partition pass.
    pending_leaves: Mutex<VecDeque<Arc<Node>>>,
    /// True while draining: every partitioned child empties onward
    /// regardless of fullness.
    flush_mode: AtomicBool,
    /// Workers not currently asleep; zero is the quiescence signal.
    awake_workers: AtomicUsize,
    sorter: Pool,
    merger: Pool,
    emptier: Pool,
    offload: Option<Arc<dyn SortOffload>>,
    /// Serializes every use of the offload device.
    offload_busy: Mutex<()>,
    /// First worker failure; drained at the public entry points.
    failure: Mutex<Option<CascadeError>>,
    rotations: AtomicU64,
    leaf_splits: AtomicU64,
    non_leaf_splits: AtomicU64,
}

impl TreeCore {
    pub(crate) fn new(
        config: TreeConfig,
        offload: Option<Arc<dyn SortOffload>>,
    ) -> Result<Arc<Self>> {
        let root = Arc::new(Node::new(
            0,
            0,
            config.buffer_capacity,
            config.buffer_threshold,
        )?);
        Ok(Arc::new(Self {
            node_ctr: AtomicU32::new(1),
            root: Mutex::new(root),
            empty_roots: Mutex::new(VecDeque::new()),
            root_available: Condvar::new(),
            sorted_nodes: Mutex::new(VecDeque::new()),
            pending_leaves: Mutex::new(VecDeque::new()),
            flush_mode: AtomicBool::new(false),
            awake_workers: AtomicUsize::new(0),
            sorter: Pool::new("sorter", WorkQueue::level()),
            merger: Pool::new("merger", WorkQueue::level()),
            emptier: Pool::new("emptier", WorkQueue::dag()),
            offload,
            offload_busy: Mutex::new(()),
            failure: Mutex::new(None),
            rotations: AtomicU64::new(0),
            leaf_splits: AtomicU64::new(0),
            non_leaf_splits: AtomicU64::new(0),
            config,
        }))
    }

    #[inline]
    pub(crate) fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub(crate) fn pool(&self, stage: Stage) -> &Pool {
        match stage {
            Stage::Sorter => &self.sorter,
            Stage::Merger => &self.merger,
            Stage::Emptier => &self.emptier,
        }
    }

    pub(crate) fn sorter(&self) -> &Pool {
        &self.sorter
    }

    pub(crate) fn merger(&self) -> &Pool {
        &self.merger
    }

    pub(crate) fn emptier(&self) -> &Pool {
        &self.emptier
    }

    #[inline]
    pub(crate) fn flush_mode(&self) -> bool {
        self.flush_mode.load(Ordering::Acquire)
    }

    pub(crate) fn set_flush_mode(&self, on: bool) {
        self.flush_mode.store(on, Ordering::Release);
    }

    pub(crate) fn worker_asleep(&self) {
        self.awake_workers.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn worker_awake(&self) {
        self.awake_workers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_failure(&self, err: CascadeError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            debug!(error = %err, "pipeline failure recorded");
            *failure = Some(err);
        }
    }

    fn peek_failure(&self) -> Option<CascadeError> {
        self.failure.lock().clone()
    }

    pub(crate) fn take_failure(&self) -> Option<CascadeError> {
        self.failure.lock().take()
    }

    /// Allocates a fresh node with a tree-unique id.
    pub(crate) fn new_node(&self, level: u32) -> Result<Arc<Node>> {
        let id = self.node_ctr.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(Node::new(
            id,
            level,
            self.config.buffer_capacity,
            self.config.buffer_threshold,
        )?))
    }

    pub(crate) fn count_leaf_split(&self) {
        self.leaf_splits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_non_leaf_split(&self) {
        self.non_leaf_splits.fetch_add(1, Ordering::Relaxed);
    }

    /// Sorts a buffer, routing through the offload device (serialized
    /// tree-wide) when one is configured.
    pub(crate) fn sort_buffer(&self, buffer: &mut Buffer) -> Result<()> {
        match &self.offload {
            Some(engine) => {
                let _device = self.offload_busy.lock();
                buffer.sort(Some(engine.as_ref()))
            }
            None => buffer.sort(None),
        }
    }

    // ---- root rotation ----

    /// Blocks until a pooled root-level node is available. This wait is
    /// the ingest thread's back-pressure.
    pub(crate) fn get_empty_root_node(&self) -> Result<Arc<Node>> {
        let mut pool = self.empty_roots.lock();
        loop {
            if let Some(node) = pool.pop_front() {
                return Ok(node);
            }
            if let Some(err) = self.peek_failure() {
                return Err(err);
            }
            trace!("ingest waiting for an empty root buffer");
            let _ = self
                .root_available
                .wait_for(&mut pool, Duration::from_millis(50));
        }
    }

    pub(crate) fn add_empty_root(&self, node: Arc<Node>) {
        let mut pool = self.empty_roots.lock();
        pool.push_back(node);
        drop(pool);
        self.root_available.notify_one();
    }

    fn root_node_available(&self) -> bool {
        let root = self.root.lock().clone();
        // Status first: while the root is mid-empty its buffer lock is
        // held for the whole partition, and this check must not wait on
        // that.
        root.status() == Action::None && root.buffer().is_empty()
    }

    /// Hands a sorted, aggregated root-level buffer to the rotation:
    /// either swap it into the root now, or queue it behind the empty
    /// already in flight. Called by the sorter; the `sorted_nodes` lock
    /// makes this the single linearization point between ingest and
    /// empty.
    pub(crate) fn add_to_sorted(self: &Arc<Self>, node: Arc<Node>) {
        let mut sorted = self.sorted_nodes.lock();
        if sorted.is_empty() && self.root_node_available() {
            self.submit_for_emptying(node);
        } else {
            trace!(node = node.id(), queued = sorted.len() + 1, "sorted node queued");
            sorted.push_back(node);
        }
    }

    /// Swaps the donor's buffer with the root's, schedules the root for
    /// emptying, and returns the donor (now holding the root's spent
    /// buffer) to the pool.
    fn submit_for_emptying(self: &Arc<Self>, node: Arc<Node>) {
        let root = self.root.lock().clone();
        {
            let mut root_buffer = root.buffer();
            let mut node_buffer = node.buffer();
            std::mem::swap(&mut *root_buffer, &mut *node_buffer);
        }
        debug!(root = root.id(), donor = node.id(), "root rotation");
        self.rotations.fetch_add(1, Ordering::Relaxed);
        node.set_status(Action::None);
        root.schedule(Action::Empty, self);
        self.add_empty_root(node);
    }

    /// Pulls the next queued sorted buffer into rotation. Called by the
    /// emptier whenever a root empty completes.
    pub(crate) fn submit_next_for_emptying(self: &Arc<Self>) {
        let mut sorted = self.sorted_nodes.lock();
        if let Some(node) = sorted.pop_front() {
            self.submit_for_emptying(node);
        }
    }

    // ---- leaf split handling ----

    pub(crate) fn queue_leaf_for_split(&self, leaf: Arc<Node>) {
        self.pending_leaves.lock().push_back(leaf);
    }

    /// Splits every queued leaf, re-splitting halves that are still full.
    /// Runs synchronously inside the emptier after a partition pass, so
    /// the topology is stable while a partition scans it.
    ///
    /// A non-full root leaf still splits during ingest: the rotation
    /// protocol needs the root's buffer back, which only an internal
    /// root provides. During the final flush it is left intact for the
    /// drain to read in place.
    pub(crate) fn handle_full_leaves(self: &Arc<Self>) -> Result<()> {
        loop {
            let leaf = self.pending_leaves.lock().pop_front();
            let Some(leaf) = leaf else {
                return Ok(());
            };

            if leaf.is_root() && !leaf.is_full() {
                if self.flush_mode() {
                    continue;
                }
                leaf.split_leaf(self)?;
                continue;
            }

            let mut work = vec![leaf];
            while let Some(node) = work.pop() {
                if !node.is_full() {
                    continue;
                }
                let sibling = node.split_leaf(self)?;
                work.push(node);
                work.push(sibling);
            }
        }
    }

    /// Replaces the root with a fresh one a level up, adopting the old
    /// root and `other` as its two children.
    pub(crate) fn promote_root(self: &Arc<Self>, other: Arc<Node>) -> Result<()> {
        let mut root_guard = self.root.lock();
        let old_root = root_guard.clone();
        let new_root = self.new_node(old_root.level() + 1)?;
        debug!(
            new_root = new_root.id(),
            left = old_root.id(),
            right = other.id(),
            level = new_root.level(),
            "root promoted"
        );
        new_root.add_child(old_root);
        new_root.add_child(other);
        *root_guard = new_root;
        Ok(())
    }

    // ---- lifecycle ----

    pub(crate) fn start_threads(self: &Arc<Self>) -> Result<()> {
        let total =
            self.config.sorter_threads + self.config.merger_threads + self.config.emptier_threads;
        self.awake_workers.store(total, Ordering::Release);
        spawn_workers(self, Stage::Sorter, self.config.sorter_threads)?;
        spawn_workers(self, Stage::Merger, self.config.merger_threads)?;
        spawn_workers(self, Stage::Emptier, self.config.emptier_threads)?;
        Ok(())
    }

    pub(crate) fn stop_threads(&self) {
        self.sorter.shutdown();
        self.merger.shutdown();
        self.emptier.shutdown();
        self.sorter.join_all();
        self.merger.join_all();
        self.emptier.join_all();
        self.awake_workers.store(0, Ordering::Release);
    }

    /// Polls until no worker runs and no queue holds work.
    ///
    /// The awake count is read first: work is always enqueued before its
    /// producer goes back to sleep, so once the count reads zero any
    /// remaining work is visible in a queue and fails the check.
    pub(crate) fn wait_for_quiescence(&self) {
        loop {
            if self.peek_failure().is_some() {
                return;
            }
            if self.awake_workers.load(Ordering::Acquire) == 0
                && self.sorter.is_drained()
                && self.merger.is_drained()
                && self.emptier.is_drained()
                && self.sorted_nodes.lock().is_empty()
            {
                return;
            }
            thread::sleep(Duration::from_micros(100));
        }
    }

    /// Splits any node left above the fanout bound by late leaf splits.
    /// Must run single-threaded (post-quiescence).
    pub(crate) fn rebalance_overfull(self: &Arc<Self>) -> Result<()> {
        loop {
            let mut overfull: Option<Arc<Node>> = None;
            let mut queue = VecDeque::new();
            queue.push_back(self.root.lock().clone());
            while let Some(node) = queue.pop_front() {
                let children = node.children_snapshot();
                if children.len() > self.config.fanout {
                    overfull = Some(node);
                    break;
                }
                queue.extend(children);
            }
            match overfull {
                Some(node) => node.split_non_leaf(self)?,
                None => return Ok(()),
            }
        }
    }

    /// Collects the leaves in left-to-right order. All leaves sit at the
    /// same depth, so a plain BFS yields them in hash order.
    pub(crate) fn collect_leaves(&self) -> Vec<Arc<Node>> {
        let mut leaves = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(self.root.lock().clone());
        while let Some(node) = queue.pop_front() {
            let children = node.children_snapshot();
            if children.is_empty() {
                leaves.push(node);
            } else {
                queue.extend(children);
            }
        }
        leaves
    }

    pub(crate) fn height(&self) -> u32 {
        let mut height = 1;
        let mut node = self.root.lock().clone();
        loop {
            let first = node.children_snapshot().into_iter().next();
            match first {
                Some(child) => {
                    height += 1;
                    node = child;
                }
                None => return height,
            }
        }
    }

    fn stats_snapshot(&self) -> TreeStats {
        TreeStats {
            height: self.height(),
            rotations: self.rotations.load(Ordering::Relaxed),
            leaf_splits: self.leaf_splits.load(Ordering::Relaxed),
            non_leaf_splits: self.non_leaf_splits.load(Ordering::Relaxed),
        }
    }
}

/// The compressed buffer tree: a write-optimized aggregation index.
///
/// Records stream in through [`bulk_insert`](Self::bulk_insert); the tree
/// groups them by key and reduces values with the record merge operator.
/// [`next_value`](Self::next_value) ends ingestion, flushes everything to
/// the leaves, and yields the aggregated records in ascending hash order.
pub struct CascadeTree {
    config: TreeConfig,
    offload: Option<Arc<dyn SortOffload>>,
    core: Option<Arc<TreeCore>>,
    /// The node the ingest thread currently appends into.
    input_node: Option<Arc<Node>>,
    all_leaves: Vec<Arc<Node>>,
    leaf_cursor: usize,
    elem_cursor: usize,
    /// False while any data is staged somewhere other than the leaves.
    all_flush: bool,
    /// True when nothing was inserted since the last clear.
    empty: bool,
    closed: bool,
}

impl CascadeTree {
    /// Creates an engine with the given configuration. Node buffers and
    /// worker threads are created lazily on first insert.
    pub fn new(config: TreeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            offload: None,
            core: None,
            input_node: None,
            all_leaves: Vec::new(),
            leaf_cursor: 0,
            elem_cursor: 0,
            all_flush: true,
            empty: true,
            closed: false,
        })
    }

    /// Creates an engine that routes buffer sorts through `offload`,
    /// falling back to the CPU on device errors.
    pub fn with_offload(config: TreeConfig, offload: Arc<dyn SortOffload>) -> Result<Self> {
        let mut tree = Self::new(config)?;
        tree.offload = Some(offload);
        Ok(tree)
    }

    fn ensure_started(&mut self) -> Result<()> {
        if self.core.is_some() {
            return Ok(());
        }
        let core = TreeCore::new(self.config.clone(), self.offload.clone())?;
        let input = core.new_node(0)?;
        for _ in 0..self.config.root_pool_size - 2 {
            let spare = core.new_node(0)?;
            core.add_empty_root(spare);
        }
        if let Err(err) = core.start_threads() {
            core.stop_threads();
            return Err(err);
        }
        debug!(
            capacity = self.config.buffer_capacity,
            threshold = self.config.buffer_threshold,
            fanout = self.config.fanout,
            "engine started"
        );
        self.core = Some(core);
        self.input_node = Some(input);
        Ok(())
    }

    /// Streams a batch of records into the tree. Amortized O(1) per
    /// record; blocks only when every root-level buffer is in flight.
    ///
    /// On error, exactly the records appended before the failure are in
    /// the tree; the caller may retry or discard the rest.
    pub fn bulk_insert(&mut self, records: &[Record]) -> Result<()> {
        if self.closed {
            return Err(CascadeError::EngineClosed);
        }
        // Once a drain has flushed to the leaves, inserting would hand
        // new buffers to a rotation protocol whose root no longer
        // rotates. Finish the drain (or clear) first.
        if self.core.is_some() && self.all_flush && !self.empty {
            return Err(CascadeError::invariant(
                "insert while a drain is in progress",
            ));
        }
        if records.is_empty() {
            return Ok(());
        }
        self.ensure_started()?;
        let core = self.core.clone().ok_or_else(|| {
            CascadeError::Internal("engine not started after ensure_started".to_string())
        })?;
        if let Some(err) = core.take_failure() {
            return Err(err);
        }
        self.all_flush = false;
        self.empty = false;

        for record in records {
            let input = match self.input_node.take() {
                Some(node) if node.is_full() => {
                    node.schedule(Action::Sort, &core);
                    core.get_empty_root_node()?
                }
                Some(node) => node,
                None => core.get_empty_root_node()?,
            };
            self.input_node = Some(input.clone());
            input.insert(*record)?;
        }
        Ok(())
    }

    /// Inserts a single record.
    pub fn insert(&mut self, record: Record) -> Result<()> {
        self.bulk_insert(std::slice::from_ref(&record))
    }

    /// Yields the next fully-aggregated record in ascending hash order,
    /// or `None` when the tree is exhausted (clearing it as a side
    /// effect). The first call flushes all buffered data to the leaves.
    pub fn next_value(&mut self) -> Result<Option<Record>> {
        if self.closed {
            return Err(CascadeError::EngineClosed);
        }
        if self.empty {
            return Ok(None);
        }
        let Some(core) = self.core.clone() else {
            self.empty = true;
            return Ok(None);
        };
        if !self.all_flush {
            self.flush_to_leaves(&core)?;
        }

        loop {
            if self.leaf_cursor >= self.all_leaves.len() {
                core.wait_for_quiescence();
                let failure = core.take_failure();
                self.teardown();
                return match failure {
                    Some(err) => Err(err),
                    None => Ok(None),
                };
            }
            let leaf = self.all_leaves[self.leaf_cursor].clone();
            let buffer = leaf.buffer();
            if self.elem_cursor < buffer.len() {
                let record = buffer.records()[self.elem_cursor];
                self.elem_cursor += 1;
                return Ok(Some(record));
            }
            drop(buffer);
            self.leaf_cursor += 1;
            self.elem_cursor = 0;
        }
    }

    /// Reads up to `max` records into `out`. Returns false once the tree
    /// is exhausted.
    pub fn bulk_read(&mut self, out: &mut Vec<Record>, max: usize) -> Result<bool> {
        while out.len() < max {
            match self.next_value()? {
                Some(record) => out.push(record),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Pushes every buffered record down to the leaves and takes the
    /// leaf snapshot the drain cursor walks.
    fn flush_to_leaves(&mut self, core: &Arc<TreeCore>) -> Result<()> {
        debug!("flushing all buffers toward the leaves");
        core.set_flush_mode(true);
        let input = match self.input_node.take() {
            Some(node) => node,
            None => core.get_empty_root_node()?,
        };
        input.schedule(Action::Sort, core);
        core.wait_for_quiescence();
        if let Some(err) = core.take_failure() {
            return Err(err);
        }
        core.rebalance_overfull()?;
        self.all_leaves = core.collect_leaves();
        self.leaf_cursor = 0;
        self.elem_cursor = 0;
        self.all_flush = true;
        debug!(
            leaves = self.all_leaves.len(),
            height = core.height(),
            "flush complete"
        );
        Ok(())
    }

    /// Stops the pipeline and drops the whole tree. The engine restarts
    /// lazily on the next insert.
    pub fn clear(&mut self) -> Result<()> {
        if self.closed {
            return Err(CascadeError::EngineClosed);
        }
        self.teardown();
        Ok(())
    }

    /// Terminal shutdown: like [`clear`](Self::clear), but every further
    /// call reports [`CascadeError::EngineClosed`].
    pub fn close(&mut self) {
        self.teardown();
        self.closed = true;
    }

    /// Diagnostic counters. Zeroed while the engine is idle.
    pub fn stats(&self) -> TreeStats {
        match &self.core {
            Some(core) => core.stats_snapshot(),
            None => TreeStats::default(),
        }
    }

    fn teardown(&mut self) {
        if let Some(core) = self.core.take() {
            debug!("tearing down tree");
            core.stop_threads();
        }
        self.input_node = None;
        self.all_leaves.clear();
        self.leaf_cursor = 0;
        self.elem_cursor = 0;
        self.all_flush = true;
        self.empty = true;
    }
}

impl Drop for CascadeTree {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            core.stop_threads();
        }
    }
}
