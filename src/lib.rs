// Copyright (C) 2025 Takayuki Sato. All Rights Reserved.
// This program is free software under MIT License.
// See the file LICENSE in this distribution for more details.

mod defer;
mod errors;
mod guard;
mod machine;
mod pool;
mod timer;

use std::time;

pub use guard::with_both;
pub use machine::{Machine, StateChanged, Transition};
pub use pool::{PanicPayload, PanicSink, Pool, Task};
pub use timer::{Handle, TaskPanic, Timer};

#[derive(Debug, PartialEq, Eq)]
pub enum ErrorKind {
    DeadlockPossible(time::Duration),
    InvalidWait(String),
}

pub struct Error {
    kind: ErrorKind,
}

/// Runs a callback once on every exit path from a scope, unless it is
/// released early with `run` or cancelled with `pass`.
pub struct Defer<F: FnOnce()> {
    callback: Option<F>,
}

pub struct ExclusiveCell<T> {
    data: parking_lot::Mutex<T>,
}

pub struct SharedCell<T> {
    data: parking_lot::RwLock<T>,
}

pub struct RecursiveCell<T> {
    data: parking_lot::ReentrantMutex<std::cell::RefCell<T>>,
    timeout: time::Duration,
}

pub struct NotifyCell<T> {
    data: parking_lot::Mutex<T>,
    notify: guard::Notify,
}

/// The locked value of a cell. Waiting is possible only while the owning
/// cell carries notification machinery; see `NotifyCell`.
pub struct Guarded<'a, T> {
    inner: parking_lot::MutexGuard<'a, T>,
    notify: Option<&'a guard::Notify>,
}
