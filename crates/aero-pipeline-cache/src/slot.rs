//! Write-once single-flight cell shared by program and pipeline entries.
//!
//! A slot starts out `Pending` when a caller claims a key, and moves exactly once to either
//! `Ready` or `Failed`. Any number of threads may block in [`Slot::wait`] while the claimant
//! produces the value; they are woken by [`Slot::publish`].

use std::fmt;

use parking_lot::{Condvar, Mutex};

use crate::error::{BuildError, DecodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    /// Claimed; the producer has not published yet.
    Pending,
    Ready,
    Failed,
}

enum SlotState<T, E> {
    Pending,
    Ready(T),
    Failed(E),
}

impl<T: Clone, E: Clone> SlotState<T, E> {
    fn resolved(&self) -> Option<Result<T, E>> {
        match self {
            Self::Pending => None,
            Self::Ready(value) => Some(Ok(value.clone())),
            Self::Failed(err) => Some(Err(err.clone())),
        }
    }

    fn status(&self) -> SlotStatus {
        match self {
            Self::Pending => SlotStatus::Pending,
            Self::Ready(_) => SlotStatus::Ready,
            Self::Failed(_) => SlotStatus::Failed,
        }
    }
}

pub struct Slot<T, E> {
    state: Mutex<SlotState<T, E>>,
    published: Condvar,
}

impl<T: Clone, E: Clone> Slot<T, E> {
    pub fn pending() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            published: Condvar::new(),
        }
    }

    pub fn status(&self) -> SlotStatus {
        self.state.lock().status()
    }

    /// Non-blocking read. Returns `None` while the slot is still pending.
    pub fn try_get(&self) -> Option<Result<T, E>> {
        self.state.lock().resolved()
    }

    /// Blocks until the slot has been published.
    pub fn wait(&self) -> Result<T, E> {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = state.resolved() {
                return result;
            }
            self.published.wait(&mut state);
        }
    }

    /// Moves a pending slot to its terminal state and wakes all waiters.
    ///
    /// Returns `false` (and drops `result`) if the slot was already published.
    pub fn publish(&self, result: Result<T, E>) -> bool {
        let mut state = self.state.lock();
        match *state {
            SlotState::Pending => {}
            SlotState::Ready(_) | SlotState::Failed(_) => return false,
        }
        *state = match result {
            Ok(value) => SlotState::Ready(value),
            Err(err) => SlotState::Failed(err),
        };
        drop(state);
        self.published.notify_all();
        true
    }
}

impl<T, E> fmt::Debug for Slot<T, E>
where
    T: Clone,
    E: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("status", &self.status())
            .finish()
    }
}

/// Error types that can describe a producer which went away without publishing.
pub(crate) trait Abandoned {
    fn abandoned() -> Self;
}

impl Abandoned for DecodeError {
    fn abandoned() -> Self {
        DecodeError::Abandoned
    }
}

impl Abandoned for BuildError {
    fn abandoned() -> Self {
        BuildError::Abandoned
    }
}

/// Publishes `E::abandoned()` into the slot if dropped before [`PublishGuard::publish`].
///
/// Keeps waiters from blocking forever when the producer unwinds.
pub(crate) struct PublishGuard<'a, T: Clone, E: Clone + Abandoned> {
    slot: &'a Slot<T, E>,
    published: bool,
}

impl<'a, T: Clone, E: Clone + Abandoned> PublishGuard<'a, T, E> {
    pub(crate) fn new(slot: &'a Slot<T, E>) -> Self {
        Self {
            slot,
            published: false,
        }
    }

    pub(crate) fn publish(mut self, result: Result<T, E>) -> bool {
        self.published = true;
        self.slot.publish(result)
    }
}

impl<T: Clone, E: Clone + Abandoned> Drop for PublishGuard<'_, T, E> {
    fn drop(&mut self) {
        if !self.published {
            self.slot.publish(Err(E::abandoned()));
        }
    }
}
