// Copyright (C) 2025 Takayuki Sato. All Rights Reserved.
// This program is free software under MIT License.
// See the file LICENSE in this distribution for more details.

use crate::{Defer, Error, ErrorKind, ExclusiveCell, Guarded, NotifyCell, RecursiveCell, SharedCell};

use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};
use std::sync::atomic;
use std::{any, cell, mem, ptr, thread, time};

const DEFAULT_LOCK_TIMEOUT: time::Duration = time::Duration::from_secs(3);

/// Notification machinery of a `NotifyCell`: the condition variable and a
/// slot that marks whether a write lock is currently installed.
pub(crate) struct Notify {
    condvar: Condvar,
    installed: atomic::AtomicBool,
}

impl Notify {
    pub(crate) const fn new() -> Self {
        Self {
            condvar: Condvar::new(),
            installed: atomic::AtomicBool::new(false),
        }
    }

    fn install(&self) {
        self.installed.store(true, atomic::Ordering::Release);
    }

    fn clear(&self) {
        self.installed.store(false, atomic::Ordering::Release);
    }

    fn is_installed(&self) -> bool {
        self.installed.load(atomic::Ordering::Acquire)
    }
}

impl<T> ExclusiveCell<T> {
    pub const fn new(data: T) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// Runs `f` on the value under the write lock.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Guarded<'_, T>) -> R) -> R {
        let mut guarded = Guarded::new(self.data.lock(), None);
        f(&mut guarded)
    }

    /// Locks the cell and returns the guarded value directly.
    pub fn lock(&self) -> Guarded<'_, T> {
        Guarded::new(self.data.lock(), None)
    }

    /// Exchanges the values of two cells without risking deadlock.
    pub fn swap(&self, other: &Self) {
        if ptr::eq(self, other) {
            return;
        }
        with_both(self, other, mem::swap);
    }
}

impl<T> SharedCell<T> {
    pub const fn new(data: T) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.data.write())
    }

    /// Runs `f` on the value under the read lock, alongside other readers.
    pub fn with_shared<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.data.read())
    }
}

impl<T> RecursiveCell<T> {
    pub const fn new(data: T) -> Self {
        Self::with_timeout(data, DEFAULT_LOCK_TIMEOUT)
    }

    pub const fn with_timeout(data: T, timeout: time::Duration) -> Self {
        Self {
            data: ReentrantMutex::new(cell::RefCell::new(data)),
            timeout,
        }
    }

    /// Shared access with same-thread re-entry. Fails with
    /// `DeadlockPossible` when the lock cannot be taken within the
    /// configured timeout.
    pub fn with_ref<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, Error> {
        let guard = self.acquire()?;
        let result = match guard.try_borrow() {
            Ok(data) => Ok(f(&data)),
            Err(_) => Err(Error::new(ErrorKind::DeadlockPossible(self.timeout))),
        };
        result
    }

    /// Mutable access. Same-thread re-entry that would alias the value is
    /// reported as `DeadlockPossible` instead of being allowed.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, Error> {
        let guard = self.acquire()?;
        let result = match guard.try_borrow_mut() {
            Ok(mut data) => Ok(f(&mut data)),
            Err(_) => Err(Error::new(ErrorKind::DeadlockPossible(self.timeout))),
        };
        result
    }

    fn acquire(&self) -> Result<parking_lot::ReentrantMutexGuard<'_, cell::RefCell<T>>, Error> {
        self.data
            .try_lock_until(time::Instant::now() + self.timeout)
            .ok_or_else(|| Error::new(ErrorKind::DeadlockPossible(self.timeout)))
    }
}

impl<T> NotifyCell<T> {
    pub const fn new(data: T) -> Self {
        Self {
            data: Mutex::new(data),
            notify: Notify::new(),
        }
    }

    /// Runs `f` on the value under the write lock. The lock is installed in
    /// the notification slot for the duration of the call, so `f` may wait
    /// on the guarded value.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Guarded<'_, T>) -> R) -> R {
        let mut guarded = Guarded::new(self.data.lock(), Some(&self.notify));
        f(&mut guarded)
    }

    pub fn notify_one(&self) {
        self.notify.condvar.notify_one();
    }

    pub fn notify_all(&self) {
        self.notify.condvar.notify_all();
    }
}

impl<'a, T> Guarded<'a, T> {
    fn new(inner: parking_lot::MutexGuard<'a, T>, notify: Option<&'a Notify>) -> Self {
        if let Some(notify) = notify {
            notify.install();
        }
        Self { inner, notify }
    }

    /// Releases the lock until the predicate holds. Only available while
    /// this lock is installed in a notification slot.
    pub fn wait_until<F>(&mut self, mut ready: F) -> Result<(), Error>
    where
        F: FnMut(&T) -> bool,
    {
        let notify = self.installed("wait_until")?;
        while !ready(&self.inner) {
            // The slot must be re-installed on every resumption; a writer
            // that ran while this thread was waiting has cleared it.
            let _restore = Defer::new(|| notify.install());
            notify.condvar.wait(&mut self.inner);
        }
        Ok(())
    }

    /// Like `wait_until`, bounded by a duration. Returns whether the
    /// predicate held on exit.
    pub fn wait_for<F>(&mut self, duration: time::Duration, ready: F) -> Result<bool, Error>
    where
        F: FnMut(&T) -> bool,
    {
        let notify = self.installed("wait_for")?;
        Ok(self.wait_with(notify, time::Instant::now() + duration, ready))
    }

    /// Like `wait_until`, bounded by a point in time. Returns whether the
    /// predicate held on exit.
    pub fn wait_deadline<F>(&mut self, deadline: time::Instant, ready: F) -> Result<bool, Error>
    where
        F: FnMut(&T) -> bool,
    {
        let notify = self.installed("wait_deadline")?;
        Ok(self.wait_with(notify, deadline, ready))
    }

    fn wait_with<F>(&mut self, notify: &'a Notify, deadline: time::Instant, mut ready: F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        while !ready(&self.inner) {
            let _restore = Defer::new(|| notify.install());
            if notify.condvar.wait_until(&mut self.inner, deadline).timed_out() {
                drop(_restore);
                return ready(&self.inner);
            }
        }
        true
    }

    fn installed(&self, method: &str) -> Result<&'a Notify, Error> {
        match self.notify {
            Some(notify) if notify.is_installed() => Ok(notify),
            _ => Err(Error::new(ErrorKind::InvalidWait(format!(
                "{}::{}",
                any::type_name::<Self>(),
                method
            )))),
        }
    }
}

impl<T> std::ops::Deref for Guarded<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> std::ops::DerefMut for Guarded<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for Guarded<'_, T> {
    fn drop(&mut self) {
        // Clear the slot before the lock itself is released.
        if let Some(notify) = self.notify {
            notify.clear();
        }
    }
}

/// Locks two cells at once using lock/try-lock with back-off, so that two
/// threads taking the cells in opposite order cannot deadlock.
pub fn with_both<A, B, R>(
    a: &ExclusiveCell<A>,
    b: &ExclusiveCell<B>,
    f: impl FnOnce(&mut A, &mut B) -> R,
) -> R {
    loop {
        {
            let mut first = a.data.lock();
            if let Some(mut second) = b.data.try_lock() {
                return f(&mut first, &mut second);
            }
        }
        {
            let mut second = b.data.lock();
            if let Some(mut first) = a.data.try_lock() {
                return f(&mut first, &mut second);
            }
        }
        thread::yield_now();
    }
}
