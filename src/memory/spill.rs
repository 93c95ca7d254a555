//! Asynchronous spill executor
//!
//! A fixed worker pool drains a priority queue of inter-tier copy jobs.
//! Submissions beyond the configured queue depth run synchronously on the
//! caller's thread, which bounds the queue's own memory use and keeps
//! producers from outrunning the workers indefinitely.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Direction of an inter-tier copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillKind {
    /// Faster tier to slower tier
    Evict,
    /// Slower tier to faster tier
    Promote,
}

/// Default priority for eviction jobs
pub const EVICT_PRIORITY: i32 = 0;

/// Default priority for promotion jobs
pub const PROMOTE_PRIORITY: i32 = 10;

type CompletionHook = Box<dyn FnOnce(bool) + Send + 'static>;

/// An immutable descriptor of one pending inter-tier copy
///
/// The submitter must keep both regions mapped until the completion hook has
/// run; the allocator's migration protocol guarantees this.
pub struct SpillJob {
    src: *const u8,
    dst: *mut u8,
    len: usize,
    kind: SpillKind,
    priority: i32,
    hook: Option<CompletionHook>,
}

// Safety: the job only carries the pointers between threads; the submitter
// owns both regions until the hook fires.
unsafe impl Send for SpillJob {}

impl SpillJob {
    /// Describe a copy of `len` bytes from `src` to `dst`
    pub fn new(src: *const u8, dst: *mut u8, len: usize, kind: SpillKind, priority: i32) -> Self {
        Self {
            src,
            dst,
            len,
            kind,
            priority,
            hook: None,
        }
    }

    /// Attach a completion hook invoked with the copy's success flag
    #[must_use]
    pub fn on_complete(mut self, hook: impl FnOnce(bool) + Send + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// The job's priority (higher runs earlier)
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// The job's direction
    pub fn kind(&self) -> SpillKind {
        self.kind
    }
}

/// Heap entry: priority decides, FIFO arrival breaks ties
struct QueuedJob {
    job: SpillJob,
    seq: u64,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.job.priority == other.job.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Configuration for the spill executor
#[derive(Debug, Clone)]
pub struct SpillConfig {
    /// Worker thread count
    pub workers: usize,
    /// Queue depth beyond which submissions run synchronously
    pub max_depth: usize,
    /// Probe for an async I/O submission backend at construction
    pub io_submission: bool,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_depth: 64,
            io_submission: true,
        }
    }
}

impl SpillConfig {
    /// Set the worker count
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the queue depth
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }
}

/// Cumulative executor statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct SpillStats {
    /// Completed eviction copies
    pub evictions: u64,
    /// Completed promotion copies
    pub promotions: u64,
    /// Bytes moved toward slower tiers
    pub bytes_evicted: u64,
    /// Bytes moved toward faster tiers
    pub bytes_promoted: u64,
    /// Running average eviction latency in milliseconds
    pub avg_evict_ms: f64,
    /// Running average promotion latency in milliseconds
    pub avg_promote_ms: f64,
}

struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    next_seq: u64,
    /// Queued plus running jobs; a job counts until its hook has returned
    pending: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    work_cv: Condvar,
    idle_cv: Condvar,
    stats: Mutex<SpillStats>,
    io_submission: bool,
    max_depth: usize,
}

impl Shared {
    fn run_job(&self, mut job: SpillJob) {
        let start = Instant::now();

        let mut success = self.io_submission && try_submit_io(&job);
        if !success {
            if job.src.is_null() || job.dst.is_null() {
                success = false;
            } else {
                if job.len > 0 {
                    // Safety: the submitter keeps both regions valid and
                    // non-overlapping until the hook has run.
                    unsafe { std::ptr::copy_nonoverlapping(job.src, job.dst, job.len) };
                }
                success = true;
            }
        }

        let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;
        {
            let mut stats = self.stats.lock();
            match job.kind {
                SpillKind::Evict => {
                    stats.evictions += 1;
                    stats.bytes_evicted += job.len as u64;
                    let n = stats.evictions as f64;
                    stats.avg_evict_ms = (stats.avg_evict_ms * (n - 1.0) + elapsed_ms) / n;
                }
                SpillKind::Promote => {
                    stats.promotions += 1;
                    stats.bytes_promoted += job.len as u64;
                    let n = stats.promotions as f64;
                    stats.avg_promote_ms = (stats.avg_promote_ms * (n - 1.0) + elapsed_ms) / n;
                }
            }
        }

        if let Some(hook) = job.hook.take() {
            hook(success);
        }
    }
}

/// Reserved probe for an asynchronous I/O submission backend.
///
/// Reports the backend absent, so every copy takes the bulk path; the flag
/// stays so a backend can be slotted in without changing the worker loop.
fn try_submit_io(_job: &SpillJob) -> bool {
    false
}

/// Fixed worker pool servicing a priority queue of copy jobs
pub struct SpillExecutor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SpillExecutor {
    /// Start the worker pool
    pub fn new(config: SpillConfig) -> Self {
        let workers = config.workers.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                pending: 0,
                shutdown: false,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            stats: Mutex::new(SpillStats::default()),
            io_submission: config.io_submission && try_submit_io_available(),
            max_depth: config.max_depth.max(1),
        });

        let handles = (0..workers)
            .map(|id| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("vgpu-spill-{id}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn spill worker")
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Start with the default configuration (2 workers, depth 64)
    pub fn with_defaults() -> Self {
        Self::new(SpillConfig::default())
    }

    /// Submit one job
    ///
    /// Queued and handed to a worker when the queue has room; otherwise the
    /// copy runs synchronously on this thread and the hook fires before the
    /// call returns.
    pub fn submit(&self, job: SpillJob) {
        let overflow = {
            let mut state = self.shared.state.lock();
            if state.shutdown || state.heap.len() >= self.shared.max_depth {
                Some(job)
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.pending += 1;
                state.heap.push(QueuedJob { job, seq });
                None
            }
        };

        match overflow {
            Some(job) => {
                debug!("spill queue saturated, running job inline");
                self.shared.run_job(job);
            }
            None => {
                self.shared.work_cv.notify_one();
            }
        }
    }

    /// Submit a batch under one lock acquisition
    ///
    /// Jobs beyond the queue depth run synchronously, in submission order,
    /// after the rest have been queued.
    pub fn submit_batch(&self, jobs: Vec<SpillJob>) {
        let mut overflow = Vec::new();
        {
            let mut state = self.shared.state.lock();
            for job in jobs {
                if state.shutdown || state.heap.len() >= self.shared.max_depth {
                    overflow.push(job);
                } else {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.pending += 1;
                    state.heap.push(QueuedJob { job, seq });
                }
            }
        }
        self.shared.work_cv.notify_all();

        for job in overflow {
            self.shared.run_job(job);
        }
    }

    /// Submit an eviction copy; the job must carry [`SpillKind::Evict`]
    pub fn submit_evict(&self, job: SpillJob) {
        debug_assert_eq!(job.kind, SpillKind::Evict);
        self.submit(job);
    }

    /// Submit a promotion copy; the job must carry [`SpillKind::Promote`]
    pub fn submit_promote(&self, job: SpillJob) {
        debug_assert_eq!(job.kind, SpillKind::Promote);
        self.submit(job);
    }

    /// Block until every pending job has completed
    pub fn wait_all(&self) {
        let mut state = self.shared.state.lock();
        while state.pending > 0 {
            self.shared.idle_cv.wait(&mut state);
        }
    }

    /// Drop queued jobs that no worker has picked up yet
    ///
    /// Their hooks are not invoked. Running jobs finish normally.
    pub fn cancel_pending(&self) {
        let mut state = self.shared.state.lock();
        let dropped = state.heap.len();
        state.heap.clear();
        state.pending -= dropped;
        if state.pending == 0 {
            self.shared.idle_cv.notify_all();
        }
    }

    /// Flush pending jobs, stop the workers and join them; idempotent
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.shared.work_cv.notify_all();

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Jobs queued or running
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending
    }

    /// Whether no job is queued or running
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Snapshot of the cumulative statistics
    pub fn stats(&self) -> SpillStats {
        *self.shared.stats.lock()
    }

    /// Zero the cumulative statistics
    pub fn reset_stats(&self) {
        *self.shared.stats.lock() = SpillStats::default();
    }
}

impl Drop for SpillExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Construction-time probe for the async I/O backend
fn try_submit_io_available() -> bool {
    false
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(queued) = state.heap.pop() {
                    break Some(queued.job);
                }
                if state.shutdown {
                    break None;
                }
                shared.work_cv.wait(&mut state);
            }
        };

        let Some(job) = job else { return };
        shared.run_job(job);

        let mut state = shared.state.lock();
        state.pending -= 1;
        if state.pending == 0 {
            shared.idle_cv.notify_all();
        }
    }
}
