// Copyright (C) 2025 Takayuki Sato. All Rights Reserved.
// This program is free software under MIT License.
// See the file LICENSE in this distribution for more details.

use crate::{Guarded, Machine, NotifyCell, Pool, Transition};

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{atomic, Arc, Weak};
use std::time::{Duration, Instant};
use std::{any, fmt, mem, thread};
use tracing::{debug, warn};

/// Runs submitted tasks on a worker pool once their delay has elapsed.
///
/// One dispatcher thread watches the due-time ordered queue and hands ready
/// tasks to the pool. Dropping the timer stops the dispatcher and cancels
/// every task still queued.
pub struct Timer {
    scheduler: Arc<Scheduler>,
    dispatcher: Option<thread::JoinHandle<()>>,
}

/// The owning reference to a delayed task. Dropping it requests
/// cancellation.
pub struct Handle {
    task: Arc<DelayedTask>,
}

/// A captured panic from a task body. Cloning shares the payload, so the
/// same panic can be raised again on every status inspection.
#[derive(Clone)]
pub struct TaskPanic {
    payload: Arc<Mutex<Box<dyn any::Any + Send>>>,
}

impl TaskPanic {
    fn new(payload: Box<dyn any::Any + Send>) -> Self {
        Self {
            payload: Arc::new(Mutex::new(payload)),
        }
    }

    /// Raises the captured panic on the calling thread.
    pub fn resume(&self) -> ! {
        panic::panic_any(self.clone())
    }

    /// Gives access to the captured payload, e.g. for downcasting.
    pub fn with<R>(&self, f: impl FnOnce(&(dyn any::Any + Send)) -> R) -> R {
        let payload = self.payload.lock();
        f(&**payload)
    }
}

impl fmt::Debug for TaskPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{ .. }}", any::type_name::<TaskPanic>())
    }
}

enum TaskPhase {
    Waiting,
    Running {
        executor: thread::ThreadId,
        restart_wanted: atomic::AtomicBool,
    },
    Done,
    Failed(TaskPanic),
    Cancelled,
}

struct DelayedTask {
    machine: Machine<TaskPhase>,
    delay: Duration,
    work: Box<dyn Fn() + Send + Sync>,
    scheduler: Weak<Scheduler>,
    me: Weak<DelayedTask>,
}

impl DelayedTask {
    fn new(
        delay: Duration,
        work: Box<dyn Fn() + Send + Sync>,
        scheduler: &Arc<Scheduler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            machine: Machine::new(TaskPhase::Waiting),
            delay,
            work,
            scheduler: Arc::downgrade(scheduler),
            me: me.clone(),
        })
    }

    fn due_time(&self) -> Instant {
        Instant::now() + self.delay
    }

    fn requeue(&self) -> bool {
        match (self.scheduler.upgrade(), self.me.upgrade()) {
            (Some(scheduler), Some(me)) => scheduler.add(&me),
            _ => false,
        }
    }

    fn reschedule(&self) -> bool {
        match (self.scheduler.upgrade(), self.me.upgrade()) {
            (Some(scheduler), Some(me)) => scheduler.reschedule(&me),
            _ => false,
        }
    }

    fn run(&self) {
        let entered = self.machine.call(|phase, _changed| match phase {
            TaskPhase::Waiting => Transition::swap(TaskPhase::Running {
                executor: thread::current().id(),
                restart_wanted: atomic::AtomicBool::new(false),
            }),
            _ => Transition::Reject,
        });
        if !entered {
            return;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| (self.work)())) {
            Ok(()) => self.finish(),
            Err(payload) => self.fail(payload),
        }
        self.machine.notify_all();
    }

    fn finish(&self) {
        let _ = self.machine.call(|phase, _changed| match phase {
            TaskPhase::Running { restart_wanted, .. } => {
                if restart_wanted.load(atomic::Ordering::Acquire) {
                    if self.requeue() {
                        Transition::swap(TaskPhase::Waiting)
                    } else {
                        Transition::swap(TaskPhase::Cancelled)
                    }
                } else {
                    Transition::swap(TaskPhase::Done)
                }
            }
            _ => Transition::Reject,
        });
    }

    fn fail(&self, payload: Box<dyn any::Any + Send>) {
        let captured = TaskPanic::new(payload);
        let _ = self.machine.call(move |phase, _changed| match phase {
            TaskPhase::Running { .. } => Transition::swap(TaskPhase::Failed(captured)),
            _ => Transition::Reject,
        });
    }

    fn cancel(&self) -> bool {
        self.cancel_inner(true)
    }

    /// Cancellation for drop paths, which must not raise a stored panic.
    fn cancel_quiet(&self) -> bool {
        self.cancel_inner(false)
    }

    fn cancel_inner(&self, rethrow_failed: bool) -> bool {
        self.machine.call(|phase, changed| match phase {
            TaskPhase::Waiting => Transition::swap(TaskPhase::Cancelled),
            TaskPhase::Running { executor, .. } => {
                if *executor == thread::current().id() {
                    Transition::swap(TaskPhase::Cancelled)
                } else {
                    // Cancelling from outside waits out the running body;
                    // the call then reports failure against the new phase.
                    changed.wait();
                    Transition::Reject
                }
            }
            TaskPhase::Done => Transition::swap(TaskPhase::Cancelled),
            TaskPhase::Failed(captured) => {
                if rethrow_failed {
                    captured.resume();
                }
                Transition::Reject
            }
            TaskPhase::Cancelled => Transition::Reject,
        })
    }

    fn restart(&self) -> bool {
        self.machine.call(|phase, _changed| match phase {
            TaskPhase::Waiting => {
                if self.reschedule() {
                    Transition::Accept
                } else {
                    // The queue no longer knows the task: the timer is
                    // stopping or the dispatcher already claimed it.
                    Transition::swap(TaskPhase::Cancelled)
                }
            }
            TaskPhase::Running { restart_wanted, .. } => {
                restart_wanted.store(true, atomic::Ordering::Release);
                Transition::Accept
            }
            TaskPhase::Failed(captured) => captured.resume(),
            _ => Transition::Reject,
        })
    }

    fn is_waiting(&self) -> bool {
        self.machine.inspect(|phase| matches!(phase, TaskPhase::Waiting))
    }

    fn is_running(&self) -> bool {
        self.machine.inspect(|phase| matches!(phase, TaskPhase::Running { .. }))
    }

    fn is_done(&self) -> bool {
        self.machine.inspect(|phase| match phase {
            TaskPhase::Done => true,
            TaskPhase::Failed(captured) => captured.resume(),
            _ => false,
        })
    }

    fn is_cancelled(&self) -> bool {
        self.machine.inspect(|phase| matches!(phase, TaskPhase::Cancelled))
    }
}

fn task_id(task: &Arc<DelayedTask>) -> usize {
    Arc::as_ptr(task) as usize
}

struct Queue {
    quit: bool,
    max: usize,
    sequence: u64,
    by_due: BTreeMap<(Instant, u64), Arc<DelayedTask>>,
    index: HashMap<usize, (Instant, u64)>,
}

impl Queue {
    fn new(max: usize) -> Self {
        Self {
            quit: false,
            max,
            sequence: 0,
            by_due: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    fn add(&mut self, task: &Arc<DelayedTask>) -> (bool, bool) {
        if self.quit || self.by_due.len() >= self.max {
            return (false, false);
        }
        let id = task_id(task);
        if self.index.contains_key(&id) {
            return (false, false);
        }
        let (key, wake) = self.place(task.due_time(), Arc::clone(task));
        self.index.insert(id, key);
        (true, wake)
    }

    fn reschedule(&mut self, task: &Arc<DelayedTask>) -> (bool, bool) {
        if self.quit {
            return (false, false);
        }
        let id = task_id(task);
        let old_key = match self.index.get(&id) {
            Some(key) => *key,
            None => return (false, false),
        };
        self.by_due.remove(&old_key);
        let (key, wake) = self.place(task.due_time(), Arc::clone(task));
        self.index.insert(id, key);
        (true, wake)
    }

    // Ties on the due time keep insertion order through the sequence
    // number. The dispatcher only needs a wake-up when the head changed.
    fn place(&mut self, due: Instant, task: Arc<DelayedTask>) -> ((Instant, u64), bool) {
        self.sequence += 1;
        let key = (due, self.sequence);
        self.by_due.insert(key, task);
        let earliest = self.by_due.first_key_value().map_or(false, |(first, _)| *first == key);
        (key, earliest)
    }

    fn nearest(&self) -> Option<Instant> {
        self.by_due.first_key_value().map(|((due, _), _)| *due)
    }

    fn ready(&self) -> bool {
        matches!(self.nearest(), Some(due) if due <= Instant::now())
    }

    fn pop_ready(&mut self) -> Option<Arc<DelayedTask>> {
        let (&key, _) = self.by_due.first_key_value()?;
        if key.0 > Instant::now() {
            return None;
        }
        let task = self.by_due.remove(&key)?;
        self.index.remove(&task_id(&task));
        Some(task)
    }

    fn drain(&mut self) -> Vec<Arc<DelayedTask>> {
        self.index.clear();
        mem::take(&mut self.by_due).into_values().collect()
    }

    fn next_task(guarded: &mut Guarded<'_, Queue>) -> Option<Arc<DelayedTask>> {
        loop {
            if guarded.quit {
                return None;
            }
            if let Some(task) = guarded.pop_ready() {
                return Some(task);
            }
            let waited = match guarded.nearest() {
                Some(due) => guarded
                    .wait_deadline(due, |queue| queue.quit || queue.ready())
                    .map(|_| ()),
                None => guarded.wait_until(|queue| queue.quit || !queue.by_due.is_empty()),
            };
            if waited.is_err() {
                return None;
            }
        }
    }
}

struct Scheduler {
    queue: NotifyCell<Queue>,
}

impl Scheduler {
    fn add(&self, task: &Arc<DelayedTask>) -> bool {
        let (added, wake) = self.queue.with_mut(|queue| queue.add(task));
        if wake {
            self.queue.notify_one();
        }
        added
    }

    fn reschedule(&self, task: &Arc<DelayedTask>) -> bool {
        let (moved, wake) = self.queue.with_mut(|queue| queue.reschedule(task));
        if wake {
            self.queue.notify_one();
        }
        moved
    }

    fn stop(&self) {
        self.queue.with_mut(|queue| queue.quit = true);
        self.queue.notify_one();
    }

    fn drain(&self) -> Vec<Arc<DelayedTask>> {
        self.queue.with_mut(|queue| queue.drain())
    }
}

impl Timer {
    pub fn new(pool: Arc<Pool>, max_queue_size: usize) -> Self {
        let scheduler = Arc::new(Scheduler {
            queue: NotifyCell::new(Queue::new(max_queue_size)),
        });

        let dispatcher = {
            let scheduler = Arc::clone(&scheduler);
            thread::Builder::new()
                .name("timer-dispatcher".to_string())
                .spawn(move || dispatch(&scheduler, &pool))
                .expect("failed to spawn the timer dispatcher")
        };

        Self {
            scheduler,
            dispatcher: Some(dispatcher),
        }
    }

    /// Schedules `work` to run on the pool after `delay`. When the queue is
    /// stopped or full the task is cancelled immediately and the returned
    /// handle reports it.
    pub fn add_delayed_task(
        &self,
        delay: Duration,
        work: impl Fn() + Send + Sync + 'static,
    ) -> Handle {
        let task = DelayedTask::new(delay, Box::new(work), &self.scheduler);
        if !self.scheduler.add(&task) {
            warn!(?delay, "delayed task rejected by the queue, cancelling it");
            task.cancel_quiet();
        }
        Handle { task }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.scheduler.stop();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
        for task in self.scheduler.drain() {
            task.cancel_quiet();
        }
    }
}

fn dispatch(scheduler: &Scheduler, pool: &Pool) {
    debug!("timer dispatcher started");
    while let Some(task) = scheduler.queue.with_mut(Queue::next_task) {
        let job = Arc::clone(&task);
        if !pool.add_task(move || job.run()) {
            warn!("worker pool refused a due task, cancelling it");
            task.cancel_quiet();
        }
    }
    debug!("timer dispatcher stopped");
}

impl Handle {
    /// True iff the cancellation took effect: the task moved to Cancelled,
    /// or the body cancelled itself from inside. Raises the stored panic on
    /// a task that failed.
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }

    /// From Waiting, moves the due time forward by the task's delay; from
    /// Running, requests one more run after the body finishes. Raises the
    /// stored panic on a task that failed.
    pub fn restart(&self) -> bool {
        self.task.restart()
    }

    pub fn is_waiting(&self) -> bool {
        self.task.is_waiting()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Raises the stored panic on a task that failed.
    pub fn is_done(&self) -> bool {
        self.task.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    pub fn delay(&self) -> Duration {
        self.task.delay
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.task.cancel_quiet();
    }
}
