// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A depth-one handoff between the thread preparing CFs and the thread
//! gridding with them.
//!
//! The producer may only start preparing the next batch once the consumer has
//! taken and released the previous one, so at most one batch is ever waiting.
//! The state goes around `Idle -> Preparing -> Ready -> Consumed -> Idle`;
//! `Aborted` and `Finished` are terminal.


use log::trace;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum HandoffState {
    Idle,
    Preparing,
    Ready,
    Consumed,
    Aborted,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum Role {
    Producer,
    Consumer,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordError {
    #[error("The consumer aborted the pipeline")]
    Aborted,

    #[error("The {role} can't move the handoff from {from} to {to}")]
    IllegalTransition {
        role: Role,
        from: HandoffState,
        to: HandoffState,
    },
}

struct Inner<T> {
    state: HandoffState,
    batch: Option<T>,
    history: Option<Vec<(Role, HandoffState)>>,
}

impl<T> Inner<T> {
    fn set(&mut self, role: Role, to: HandoffState) {
        trace!("handoff: {role} {} -> {to}", self.state);
        self.state = to;
        if let Some(h) = self.history.as_mut() {
            h.push((role, to));
        }
    }

    fn illegal(&self, role: Role, to: HandoffState) -> CoordError {
        CoordError::IllegalTransition {
            role,
            from: self.state,
            to,
        }
    }
}

pub struct CoordinationChannel<T> {
    inner: Mutex<Inner<T>>,
    changed: Condvar,
}

impl<T> Default for CoordinationChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CoordinationChannel<T> {
    pub fn new() -> CoordinationChannel<T> {
        CoordinationChannel {
            inner: Mutex::new(Inner {
                state: HandoffState::Idle,
                batch: None,
                history: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Like [`CoordinationChannel::new`], but every transition is recorded;
    /// see [`CoordinationChannel::history`].
    pub fn with_history() -> CoordinationChannel<T> {
        let c = Self::new();
        c.inner.lock().history = Some(vec![]);
        c
    }

    pub fn state(&self) -> HandoffState {
        self.inner.lock().state
    }

    /// Every `(role, new state)` so far. Empty unless made with
    /// [`CoordinationChannel::with_history`].
    pub fn history(&self) -> Vec<(Role, HandoffState)> {
        self.inner.lock().history.clone().unwrap_or_default()
    }

    /// Producer: start preparing a batch. Blocks while the previous batch is
    /// unreleased.
    pub fn begin_preparing(&self) -> Result<(), CoordError> {
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                HandoffState::Idle => {
                    inner.set(Role::Producer, HandoffState::Preparing);
                    self.changed.notify_all();
                    return Ok(());
                }
                HandoffState::Ready | HandoffState::Consumed => self.changed.wait(&mut inner),
                HandoffState::Aborted => return Err(CoordError::Aborted),
                HandoffState::Preparing | HandoffState::Finished => {
                    return Err(inner.illegal(Role::Producer, HandoffState::Preparing))
                }
            }
        }
    }

    /// Producer: hand over a prepared batch.
    pub fn publish(&self, batch: T) -> Result<(), CoordError> {
        let mut inner = self.inner.lock();
        match inner.state {
            HandoffState::Preparing => {
                inner.batch = Some(batch);
                inner.set(Role::Producer, HandoffState::Ready);
                self.changed.notify_all();
                Ok(())
            }
            HandoffState::Aborted => Err(CoordError::Aborted),
            _ => Err(inner.illegal(Role::Producer, HandoffState::Ready)),
        }
    }

    /// Producer: there are no more batches. Blocks until the last batch has
    /// been released.
    pub fn finish(&self) -> Result<(), CoordError> {
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                HandoffState::Idle | HandoffState::Preparing => {
                    inner.set(Role::Producer, HandoffState::Finished);
                    self.changed.notify_all();
                    return Ok(());
                }
                HandoffState::Ready | HandoffState::Consumed => self.changed.wait(&mut inner),
                HandoffState::Aborted => return Err(CoordError::Aborted),
                HandoffState::Finished => {
                    return Err(inner.illegal(Role::Producer, HandoffState::Finished))
                }
            }
        }
    }

    /// Consumer: wait for the next batch. `None` means the producer finished,
    /// or the pipeline was aborted.
    pub fn take(&self) -> Result<Option<T>, CoordError> {
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                HandoffState::Ready => {
                    inner.set(Role::Consumer, HandoffState::Consumed);
                    self.changed.notify_all();
                    return Ok(inner.batch.take());
                }
                HandoffState::Idle | HandoffState::Preparing => self.changed.wait(&mut inner),
                HandoffState::Finished | HandoffState::Aborted => return Ok(None),
                HandoffState::Consumed => {
                    return Err(inner.illegal(Role::Consumer, HandoffState::Consumed))
                }
            }
        }
    }

    /// Consumer: done with the taken batch; let the producer continue.
    pub fn release(&self) -> Result<(), CoordError> {
        let mut inner = self.inner.lock();
        match inner.state {
            HandoffState::Consumed => {
                inner.set(Role::Consumer, HandoffState::Idle);
                self.changed.notify_all();
                Ok(())
            }
            HandoffState::Aborted => Err(CoordError::Aborted),
            _ => Err(inner.illegal(Role::Consumer, HandoffState::Idle)),
        }
    }

    /// Consumer: stop the pipeline. Any waiting batch is dropped, and the
    /// producer sees [`CoordError::Aborted`] at its next call.
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        if inner.state != HandoffState::Aborted {
            inner.batch = None;
            inner.set(Role::Consumer, HandoffState::Aborted);
            self.changed.notify_all();
        }
    }
}
