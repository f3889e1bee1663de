// Copyright (C) 2025 Takayuki Sato. All Rights Reserved.
// This program is free software under MIT License.
// See the file LICENSE in this distribution for more details.

use crate::{Guarded, NotifyCell};

use std::panic::{self, AssertUnwindSafe};
use std::{any, collections::VecDeque, process, sync::Arc, thread};
use tracing::{debug, error};

pub type Task = Box<dyn FnOnce() + Send + 'static>;
pub type PanicPayload = Box<dyn any::Any + Send + 'static>;
pub type PanicSink = Box<dyn Fn(PanicPayload) + Send + Sync + 'static>;

/// A fixed set of worker threads draining a FIFO task queue.
///
/// A task that panics has its payload forwarded to the panic sink; without
/// a sink the process aborts. Dropping the pool stops the workers; tasks
/// that have not started yet never run.
pub struct Pool {
    queue: Arc<NotifyCell<TaskQueue>>,
    workers: Vec<thread::JoinHandle<()>>,
}

struct TaskQueue {
    stopping: bool,
    tasks: VecDeque<Task>,
}

impl TaskQueue {
    fn push(&mut self, task: Task) -> bool {
        if self.stopping {
            return false;
        }
        self.tasks.push_back(task);
        true
    }

    fn next(guarded: &mut Guarded<'_, TaskQueue>) -> Option<Task> {
        loop {
            if guarded.stopping {
                return None;
            }
            if let Some(task) = guarded.tasks.pop_front() {
                return Some(task);
            }
            let waited = guarded.wait_until(|queue| queue.stopping || !queue.tasks.is_empty());
            if waited.is_err() {
                return None;
            }
        }
    }
}

impl Pool {
    pub fn new(worker_count: usize) -> Self {
        Self::create(worker_count, None)
    }

    pub fn with_sink(
        worker_count: usize,
        sink: impl Fn(PanicPayload) + Send + Sync + 'static,
    ) -> Self {
        Self::create(worker_count, Some(Box::new(sink)))
    }

    fn create(worker_count: usize, sink: Option<PanicSink>) -> Self {
        let queue = Arc::new(NotifyCell::new(TaskQueue {
            stopping: false,
            tasks: VecDeque::new(),
        }));
        let sink = Arc::new(sink);

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let queue = Arc::clone(&queue);
            let sink = Arc::clone(&sink);
            let worker = thread::Builder::new()
                .name(format!("pool-worker-{index}"))
                .spawn(move || run_worker(index, &queue, &sink))
                .expect("failed to spawn a pool worker");
            workers.push(worker);
        }

        Self { queue, workers }
    }

    /// Appends a task to the queue. Returns false once the pool has been
    /// told to stop.
    pub fn add_task(&self, task: impl FnOnce() + Send + 'static) -> bool {
        let accepted = self.queue.with_mut(|queue| queue.push(Box::new(task)));
        if accepted {
            self.queue.notify_one();
        }
        accepted
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.queue.with_mut(|queue| queue.stopping = true);
        self.queue.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

// A worker is idle between tasks, waiting while the queue is empty, running
// while it holds a task, and terminates when it observes the stop flag.
fn run_worker(index: usize, queue: &NotifyCell<TaskQueue>, sink: &Option<PanicSink>) {
    debug!(worker = index, "pool worker started");
    while let Some(task) = queue.with_mut(TaskQueue::next) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            match sink {
                Some(sink) => sink(payload),
                None => {
                    error!(worker = index, "task panicked and no panic sink is installed");
                    process::abort();
                }
            }
        }
    }
    debug!(worker = index, "pool worker stopped");
}
