//! Credit-based flow control.
//!
//! One [`CreditManager`] models each send-side budget of the connection: the
//! connection-wide byte window, every stream's byte window, and the number of
//! concurrent stream slots the peer allows. Requests that cannot be served
//! immediately queue in FIFO order and are released as credit is adjusted.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Error, Result};

struct Waiter {
    id: u64,
    amount: i32,
    tx: oneshot::Sender<i32>,
}

#[derive(Default)]
struct CreditState {
    current: i32,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    disposed: bool,
}

/// A flow-control window with async acquisition.
pub struct CreditManager {
    name: &'static str,
    owner_id: u32,
    state: Mutex<CreditState>,
}

impl std::fmt::Debug for CreditManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CreditManager")
            .field("name", &self.name)
            .field("owner_id", &self.owner_id)
            .field("current", &state.current)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl CreditManager {
    /// `owner_id` is the stream id (0 for connection-level managers) and is
    /// only used for diagnostics.
    pub fn new(name: &'static str, owner_id: u32, initial_credit: i32) -> Self {
        Self {
            name,
            owner_id,
            state: Mutex::new(CreditState {
                current: initial_credit,
                ..CreditState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CreditState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current balance. May be negative after a SETTINGS-driven shrink.
    pub fn current(&self) -> i32 {
        self.lock().current
    }

    /// Cheap probe: can at least one unit be granted right now?
    pub fn is_credit_available(&self) -> bool {
        self.lock().current > 0
    }

    /// Take exactly `amount` if it is available and nobody is queued ahead.
    pub fn try_acquire_no_wait(&self, amount: i32) -> bool {
        debug_assert!(amount > 0);
        let mut state = self.lock();
        if state.disposed || !state.waiters.is_empty() || state.current < amount {
            return false;
        }
        state.current -= amount;
        true
    }

    /// Acquire up to `amount` credit, waiting while none is available.
    ///
    /// The grant may be smaller than `amount`; callers loop for the rest.
    /// Cancelling leaves other waiters' order intact. Disposal of the manager
    /// fails the wait with [`Error::Disposed`].
    pub async fn acquire(&self, amount: i32, cancel: &CancellationToken) -> Result<i32> {
        debug_assert!(amount > 0);
        let (id, mut rx) = {
            let mut state = self.lock();
            if state.disposed {
                return Err(Error::Disposed);
            }
            if state.current > 0 && state.waiters.is_empty() {
                let granted = amount.min(state.current);
                state.current -= granted;
                return Ok(granted);
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, amount, tx });
            trace!(manager = self.name, owner = self.owner_id, amount, "waiting for credit");
            (id, rx)
        };

        tokio::select! {
            biased;
            granted = &mut rx => granted.map_err(|_| Error::Disposed),
            _ = cancel.cancelled() => {
                let still_queued = {
                    let mut state = self.lock();
                    match state.waiters.iter().position(|w| w.id == id) {
                        Some(pos) => {
                            state.waiters.remove(pos);
                            true
                        }
                        None => false,
                    }
                };
                if !still_queued {
                    // Granted between the cancellation and our dequeue: hand it back.
                    if let Ok(granted) = rx.try_recv() {
                        let _ = self.adjust_credit(granted);
                    }
                }
                Err(Error::Cancelled)
            }
        }
    }

    /// Add `delta` (which may be negative) to the balance and release queued
    /// waiters in FIFO order while credit remains.
    pub fn adjust_credit(&self, delta: i32) -> Result<()> {
        let mut state = self.lock();
        if state.disposed {
            return Ok(());
        }

        let updated = state.current as i64 + delta as i64;
        if updated > i32::MAX as i64 {
            return Err(Error::flow_control(format!(
                "{} window for stream {} overflows: {} + {}",
                self.name, self.owner_id, state.current, delta
            )));
        }
        state.current = updated.max(i32::MIN as i64) as i32;

        while state.current > 0 {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            let granted = waiter.amount.min(state.current);
            state.current -= granted;
            if waiter.tx.send(granted).is_err() {
                // The waiting future was dropped.
                state.current += granted;
            }
        }
        Ok(())
    }

    /// Tear down: fail every queued waiter and reject future acquisitions.
    pub fn dispose(&self) {
        let mut state = self.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.waiters.clear();
        trace!(manager = self.name, owner = self.owner_id, "credit manager disposed");
    }
}
