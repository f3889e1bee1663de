// Copyright (C) 2025 Takayuki Sato. All Rights Reserved.
// This program is free software under MIT License.
// See the file LICENSE in this distribution for more details.

use crate::{Guarded, NotifyCell};

use std::sync::Arc;

/// The answer a phase method gives: refuse the call, accept it in place, or
/// accept it and replace the phase.
pub enum Transition<P> {
    Reject,
    Accept,
    AcceptAndSwap(Arc<P>),
}

impl<P> Transition<P> {
    pub fn swap(next: P) -> Self {
        Self::AcceptAndSwap(Arc::new(next))
    }

    fn accepted(&self) -> bool {
        !matches!(self, Self::Reject)
    }
}

/// A state machine over immutable phases. Every transition is a whole-phase
/// replacement performed under the machine's lock, so observers see a
/// monotonic sequence of phases.
pub struct Machine<P> {
    phase: NotifyCell<Arc<P>>,
}

/// Witness handed to every phase method. It reports whether the live phase
/// still is the one the method was invoked on, and can block until the two
/// diverge.
pub struct StateChanged<'c, 'g, P> {
    guarded: &'c mut Guarded<'g, Arc<P>>,
    persistent: &'c Arc<P>,
}

impl<P> StateChanged<'_, '_, P> {
    pub fn changed(&self) -> bool {
        !Arc::ptr_eq(&**self.guarded, self.persistent)
    }

    /// Releases the machine's lock until another thread replaces the phase.
    pub fn wait(&mut self) {
        let persistent = Arc::clone(self.persistent);
        // The machine's cell always carries a condition variable, so the
        // wait cannot be rejected.
        let _ = self
            .guarded
            .wait_until(move |current| !Arc::ptr_eq(current, &persistent));
    }
}

impl<P> Machine<P> {
    pub fn new(initial: P) -> Self {
        Self {
            phase: NotifyCell::new(Arc::new(initial)),
        }
    }

    /// Invokes a phase method under the lock and installs the phase it
    /// returns. If the method suspended through the witness and the live
    /// phase moved on meanwhile, the method ran on a stale view: its
    /// verdict is returned as-is but nothing is installed.
    pub fn call<F>(&self, method: F) -> bool
    where
        F: FnOnce(&P, &mut StateChanged<'_, '_, P>) -> Transition<P>,
    {
        self.phase.with_mut(|guarded| {
            let persistent = Arc::clone(&**guarded);
            let request = {
                let mut witness = StateChanged {
                    guarded: &mut *guarded,
                    persistent: &persistent,
                };
                method(&persistent, &mut witness)
            };

            if !Arc::ptr_eq(&**guarded, &persistent) {
                return request.accepted();
            }

            match request {
                Transition::Reject => false,
                Transition::Accept => true,
                Transition::AcceptAndSwap(next) => {
                    **guarded = next;
                    true
                }
            }
        })
    }

    /// Reads the current phase under the lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        self.phase.with_mut(|guarded| f(&**guarded))
    }

    pub fn notify_one(&self) {
        self.phase.notify_one();
    }

    pub fn notify_all(&self) {
        self.phase.notify_all();
    }
}
