#![deny(unsafe_code)]
#![deny(missing_docs)]

//! # Overview
//!
//! `pool` runs the diff, compression, and apply tasks a per-connection
//! worker schedules while replicating shadowed resources. The pool has a
//! fixed thread count chosen at session start; a self-pipe is written on
//! every task completion so the enqueuing thread can fold "work finished"
//! into the same `poll` set as its sockets.
//!
//! # Design
//!
//! Shared state is one mutex-protected deque plus a condition variable for
//! the workers, a counter of tasks dequeued but not yet finished, and a
//! sticky error slot. Draining is cooperative: [`WorkerPool::wait_for_drain`]
//! has the enqueuer execute queued tasks itself whenever the workers are
//! behind, which keeps a zero-thread pool functional and prevents the
//! enqueuer from idling while work is queued.
//!
//! # Invariants
//!
//! - No ordering is guaranteed between concurrent tasks; callers that need
//!   ordering assign it at enqueue time (the transfer queue's message
//!   numbers).
//! - `Stop` is a sentinel consumed by exactly one worker; in-flight tasks
//!   are never interrupted.
//! - The first task failure is retained until taken; later failures are
//!   logged and dropped.

use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use rustix::event::{PollFd, PollFlags, Timespec, poll};
use rustix::io::Errno;
use rustix::pipe::{PipeFlags, pipe_with};
use tracing::{error, trace};

/// Classifies a task for diagnostics; the pool itself treats all work alike.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskKind {
    /// Compare a damage interval against the mirror and emit diff segments.
    DiffRegion,
    /// Compress a finished block payload.
    CompressBlock,
    /// Expand a received block payload.
    DecompressBlock,
    /// Patch received diff segments into a local mapping.
    ApplyDiff,
}

/// Boxed work item; errors surface through the pool's sticky error slot.
pub type TaskFn = Box<dyn FnOnce() -> Result<(), BoxedTaskError> + Send>;

/// Error type tasks report with.
pub type BoxedTaskError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the pool itself.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Creating the self-pipe failed.
    #[error("could not create pool self-pipe: {0}")]
    SelfPipe(#[from] rustix::io::Errno),

    /// A task reported a fatal error.
    #[error("{kind:?} task failed: {source}")]
    TaskFailed {
        /// Kind of the failing task.
        kind: TaskKind,
        /// Error the task returned.
        source: BoxedTaskError,
    },
}

enum Task {
    Run(TaskKind, TaskFn),
    Stop,
}

struct Queue {
    tasks: VecDeque<Task>,
    in_progress: usize,
    error: Option<PoolError>,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    completion_w: OwnedFd,
}

impl Shared {
    fn signal_completion(&self) {
        // A full pipe already guarantees a pending wakeup.
        match rustix::io::write(&self.completion_w, &[0u8]) {
            Ok(_) | Err(Errno::AGAIN) => {}
            Err(err) => trace!("self-pipe write failed: {err}"),
        }
    }

    fn run_one(&self, kind: TaskKind, task: TaskFn) {
        let result = task();
        let mut queue = self.queue.lock().unwrap();
        queue.in_progress -= 1;
        if let Err(source) = result {
            let failure = PoolError::TaskFailed { kind, source };
            if queue.error.is_none() {
                queue.error = Some(failure);
            } else {
                error!("additional pool task failure dropped: {failure}");
            }
        }
        drop(queue);
        self.signal_completion();
    }
}

/// Fixed pool of worker threads plus the enqueuing thread.
pub struct WorkerPool {
    shared: Arc<Shared>,
    completion_r: OwnedFd,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers. Zero is valid; every task then runs inline
    /// during [`wait_for_drain`](Self::wait_for_drain).
    pub fn new(threads: usize) -> Result<Self, PoolError> {
        let (completion_r, completion_w) =
            pipe_with(PipeFlags::NONBLOCK | PipeFlags::CLOEXEC)?;
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                in_progress: 0,
                error: None,
            }),
            available: Condvar::new(),
            completion_w,
        });
        let handles = (0..threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("pool-{index}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawn pool thread")
            })
            .collect();
        Ok(Self {
            shared,
            completion_r,
            threads: handles,
        })
    }

    /// Queues one task.
    pub fn enqueue(&self, kind: TaskKind, task: TaskFn) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.tasks.push_back(Task::Run(kind, task));
        drop(queue);
        self.shared.available.notify_one();
    }

    /// Read end of the completion self-pipe, for inclusion in caller
    /// pollsets.
    pub fn completion_fd(&self) -> BorrowedFd<'_> {
        self.completion_r.as_fd()
    }

    /// Empties the completion self-pipe.
    ///
    /// Callers folding [`completion_fd`](Self::completion_fd) into their
    /// own pollset must drain it after a wakeup or the pipe stays readable
    /// forever.
    pub fn drain_completions(&self) {
        self.drain_pipe();
    }

    /// Blocks until every queued task has completed.
    ///
    /// The caller drains the self-pipe, then either observes an empty queue
    /// with nothing in flight, executes one queued task itself, or sleeps
    /// briefly on the self-pipe while workers finish.
    pub fn wait_for_drain(&self) -> Result<(), PoolError> {
        loop {
            self.drain_pipe();
            let mut queue = self.shared.queue.lock().unwrap();
            if let Some(error) = queue.error.take() {
                return Err(error);
            }
            let head_is_runnable = matches!(queue.tasks.front(), Some(Task::Run(..)));
            if head_is_runnable {
                let Some(Task::Run(kind, task)) = queue.tasks.pop_front() else {
                    unreachable!("head checked runnable under the same lock");
                };
                queue.in_progress += 1;
                drop(queue);
                self.shared.run_one(kind, task);
                continue;
            }
            if queue.in_progress == 0 {
                return Ok(());
            }
            drop(queue);
            self.sleep_on_pipe();
        }
    }

    /// Takes the sticky error, if a task failed since the last drain.
    pub fn take_error(&self) -> Option<PoolError> {
        self.shared.queue.lock().unwrap().error.take()
    }

    fn drain_pipe(&self) {
        let mut sink = [0u8; 64];
        while matches!(rustix::io::read(&self.completion_r, &mut sink), Ok(n) if n > 0) {}
    }

    fn sleep_on_pipe(&self) {
        let mut fds = [PollFd::new(&self.completion_r, PollFlags::IN)];
        let nap = Timespec {
            tv_sec: 0,
            tv_nsec: 2_000_000,
        };
        match poll(&mut fds, Some(&nap)) {
            Ok(_) | Err(Errno::INTR) => {}
            Err(err) => trace!("self-pipe poll failed: {err}"),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            for _ in &self.threads {
                queue.tasks.push_back(Task::Stop);
            }
        }
        self.shared.available.notify_all();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("pool worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let mut queue = shared.queue.lock().unwrap();
        let task = loop {
            if let Some(task) = queue.tasks.pop_front() {
                break task;
            }
            queue = shared.available.wait(queue).unwrap();
        };
        match task {
            Task::Stop => return,
            Task::Run(kind, task) => {
                queue.in_progress += 1;
                drop(queue);
                shared.run_one(kind, task);
            }
        }
    }
}
