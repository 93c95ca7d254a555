//! Work-stealing task executor
//!
//! One double-ended queue per worker: the owner pushes and pops at the
//! tail, thieves take from the head. Submissions from a worker thread land
//! on that worker's own queue; submissions from outside pick a victim queue
//! round-robin. Each task carries a priority tag the queues use as a hint
//! when choosing what to hand out next.
//!
//! Workers bind to the CPU set of a NUMA node at start-up, distributing
//! round-robin across the detected nodes.

use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::topology;

/// Scheduling hint carried by every submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TaskPriority {
    /// Background work
    Low,
    /// Default
    #[default]
    Normal,
    /// Latency-sensitive work
    High,
}

/// Panic reason captured from a failed task
#[derive(Debug, Clone)]
pub struct TaskPanic(pub String);

impl std::fmt::Display for TaskPanic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task panicked: {}", self.0)
    }
}

impl std::error::Error for TaskPanic {}

type BoxedTask = Box<dyn FnOnce() + Send + 'static>;

struct TaskState<T> {
    result: Mutex<Option<std::result::Result<T, TaskPanic>>>,
    cv: Condvar,
}

/// Completion handle resolving to the task's result or its panic reason
pub struct TaskHandle<T> {
    state: Arc<TaskState<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task has run and take its outcome
    pub fn join(self) -> std::result::Result<T, TaskPanic> {
        let mut result = self.state.result.lock();
        while result.is_none() {
            self.state.cv.wait(&mut result);
        }
        result.take().expect("checked above")
    }

    /// Whether the task has finished
    pub fn is_finished(&self) -> bool {
        self.state.result.lock().is_some()
    }
}

/// Three priority lanes per worker; owner works the tail, thieves the head
#[derive(Default)]
struct WorkQueue {
    high: VecDeque<BoxedTask>,
    normal: VecDeque<BoxedTask>,
    low: VecDeque<BoxedTask>,
}

impl WorkQueue {
    fn push(&mut self, task: BoxedTask, priority: TaskPriority) {
        match priority {
            TaskPriority::High => self.high.push_back(task),
            TaskPriority::Normal => self.normal.push_back(task),
            TaskPriority::Low => self.low.push_back(task),
        }
    }

    /// Owner pop: tail of the highest non-empty lane
    fn pop_back(&mut self) -> Option<BoxedTask> {
        self.high
            .pop_back()
            .or_else(|| self.normal.pop_back())
            .or_else(|| self.low.pop_back())
    }

    /// Thief pop: head of the highest non-empty lane
    fn steal_front(&mut self) -> Option<BoxedTask> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }
}

struct PoolState {
    /// Tasks sitting in queues, not yet claimed by a worker
    queued: usize,
    /// Queued plus running tasks
    in_flight: usize,
    shutdown: bool,
}

struct PoolShared {
    id: usize,
    queues: Vec<Mutex<WorkQueue>>,
    state: Mutex<PoolState>,
    work_cv: Condvar,
    idle_cv: Condvar,
}

thread_local! {
    /// `(pool id, worker index)` of the executor thread, if any
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

/// Work-stealing worker pool
pub struct WorkStealingPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_victim: AtomicUsize,
}

impl WorkStealingPool {
    /// Start a pool with `threads` workers; `0` selects the hardware
    /// concurrency
    pub fn new(threads: usize) -> Self {
        let threads = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        };

        let shared = Arc::new(PoolShared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            queues: (0..threads).map(|_| Mutex::new(WorkQueue::default())).collect(),
            state: Mutex::new(PoolState {
                queued: 0,
                in_flight: 0,
                shutdown: false,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
        });

        let handles = (0..threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("vgpu-worker-{index}"))
                    .spawn(move || worker_loop(&shared, index))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        Self {
            shared,
            threads: Mutex::new(handles),
            next_victim: AtomicUsize::new(0),
        }
    }

    /// Start a pool sized to the hardware concurrency
    pub fn with_defaults() -> Self {
        Self::new(0)
    }

    /// Submit a task and receive its completion handle
    ///
    /// After shutdown the handle resolves immediately to a panic reason
    /// instead of running the task.
    pub fn submit<T, F>(&self, priority: TaskPriority, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let state = Arc::new(TaskState {
            result: Mutex::new(None),
            cv: Condvar::new(),
        });

        let task_state = Arc::clone(&state);
        let task: BoxedTask = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f)).map_err(|p| TaskPanic(panic_message(&p)));
            *task_state.result.lock() = Some(outcome);
            task_state.cv.notify_all();
        });

        {
            let mut st = self.shared.state.lock();
            if st.shutdown {
                drop(st);
                *state.result.lock() =
                    Some(Err(TaskPanic("pool is shut down".to_string())));
                state.cv.notify_all();
                return TaskHandle { state };
            }
            st.queued += 1;
            st.in_flight += 1;
        }

        let victim = self.pick_queue();
        self.shared.queues[victim].lock().push(task, priority);
        self.shared.work_cv.notify_one();

        TaskHandle { state }
    }

    /// Submit at normal priority
    pub fn spawn<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(TaskPriority::Normal, f)
    }

    /// Block until every submitted task has completed
    pub fn wait_all(&self) {
        let mut st = self.shared.state.lock();
        while st.in_flight > 0 {
            self.shared.idle_cv.wait(&mut st);
        }
    }

    /// Drain queued tasks, stop the workers and join them; idempotent
    pub fn shutdown(&self) {
        {
            let mut st = self.shared.state.lock();
            if st.shutdown {
                return;
            }
            st.shutdown = true;
        }
        self.shared.work_cv.notify_all();

        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Worker thread count
    pub fn num_threads(&self) -> usize {
        self.shared.queues.len()
    }

    /// Tasks queued or running
    pub fn pending_tasks(&self) -> usize {
        self.shared.state.lock().in_flight
    }

    /// A submitting worker uses its own queue; other threads rotate
    fn pick_queue(&self) -> usize {
        if let Some((pool_id, index)) = CURRENT_WORKER.get() {
            if pool_id == self.shared.id {
                return index;
            }
        }
        self.next_victim.fetch_add(1, Ordering::Relaxed) % self.shared.queues.len()
    }
}

impl Drop for WorkStealingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Arc<PoolShared>, index: usize) {
    bind_to_numa_node(index);
    CURRENT_WORKER.set(Some((shared.id, index)));

    loop {
        // Claim one unit of queued work, or exit once shutdown has drained
        // the queues.
        {
            let mut st = shared.state.lock();
            loop {
                if st.queued > 0 {
                    st.queued -= 1;
                    break;
                }
                if st.shutdown {
                    return;
                }
                shared.work_cv.wait(&mut st);
            }
        }

        // The claim guarantees a task exists somewhere; own tail first,
        // then steal heads round-robin.
        let task = loop {
            if let Some(task) = shared.queues[index].lock().pop_back() {
                break task;
            }
            let n = shared.queues.len();
            let stolen = (1..n).find_map(|offset| {
                shared.queues[(index + offset) % n].lock().steal_front()
            });
            if let Some(task) = stolen {
                break task;
            }
            // The matching push is still in flight between the claim and
            // the queue insert.
            thread::yield_now();
        };

        task();

        let mut st = shared.state.lock();
        st.in_flight -= 1;
        if st.in_flight == 0 {
            shared.idle_cv.notify_all();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Pin the worker to the CPU set of a NUMA node, round-robin over nodes
#[cfg(target_os = "linux")]
fn bind_to_numa_node(index: usize) {
    use tracing::debug;

    let nodes = topology::numa_topology();
    if nodes.is_empty() {
        return;
    }
    let node = &nodes[index % nodes.len()];
    if node.cpus.is_empty() {
        return;
    }

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in &node.cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            debug!(worker = index, node = node.id, "cpu affinity binding failed");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_to_numa_node(_index: usize) {
    let _ = topology::numa_topology();
}
