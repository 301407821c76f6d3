// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Promise/completion pair tying an asynchronous inference request to the
//! output frame that wraps its result.
//!
//! The engine receives the [`Promise`] and fulfils it exactly once from its
//! own execution queue. The stage and every consumer of the output frame
//! share the [`Completion`]; [`Completion::wait`] is the only blocking
//! primitive and all waiters observe the same outcome.

use crate::{
    error::{Error, Result},
    frame::Tensor,
};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, TryLockError};
use tracing::debug;

type Outcome = std::result::Result<Vec<Tensor>, Arc<Error>>;

/// Creates a connected promise and completion.
pub fn channel() -> (Promise, Arc<Completion>) {
    let (tx, rx) = kanal::bounded(1);
    let completion = Completion {
        rx: Mutex::new(Some(rx)),
        outcome: OnceLock::new(),
    };
    (Promise { tx }, Arc::new(completion))
}

/// Producer side, held by the engine while a request is in flight.
pub struct Promise {
    tx: kanal::Sender<Result<Vec<Tensor>>>,
}

impl Promise {
    /// Publishes the output tensors, or the error that ended the request.
    pub fn fulfil(self, outcome: Result<Vec<Tensor>>) {
        if self.tx.send(outcome).is_err() {
            debug!("completion dropped before the request finished");
        }
    }
}

/// Consumer side, shared by the request slot and the output frame.
pub struct Completion {
    rx: Mutex<Option<kanal::Receiver<Result<Vec<Tensor>>>>>,
    outcome: OnceLock<Outcome>,
}

impl Completion {
    /// A completion that is already resolved with `tensors`.
    pub fn ready(tensors: Vec<Tensor>) -> Arc<Self> {
        let completion = Completion {
            rx: Mutex::new(None),
            outcome: OnceLock::new(),
        };
        let _ = completion.outcome.set(Ok(tensors));
        Arc::new(completion)
    }

    /// Blocks until the request completes and returns its output tensors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestFailed`] wrapping the engine's error, or an
    /// inference error if the engine dropped the promise unfulfilled.
    pub fn wait(&self) -> Result<&[Tensor]> {
        match self.settle() {
            Ok(tensors) => Ok(tensors),
            Err(e) => Err(Error::RequestFailed(Arc::clone(e))),
        }
    }

    /// Non-blocking check whether the outcome is available. Returns `false`
    /// while another thread is blocked in [`wait`](Self::wait).
    pub fn is_ready(&self) -> bool {
        if self.outcome.get().is_some() {
            return true;
        }
        let mut rx = match self.rx.try_lock() {
            Ok(rx) => rx,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return self.outcome.get().is_some(),
        };
        let polled = match rx.as_ref().map(|rx| rx.try_recv()) {
            Some(Ok(Some(result))) => Some(result.map_err(Arc::new)),
            Some(Ok(None)) => None,
            Some(Err(_)) => Some(Err(Arc::new(abandoned()))),
            None => return self.outcome.get().is_some(),
        };
        match polled {
            Some(outcome) => {
                rx.take();
                let _ = self.outcome.set(outcome);
                true
            }
            None => false,
        }
    }

    fn settle(&self) -> &Outcome {
        if let Some(outcome) = self.outcome.get() {
            return outcome;
        }
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        let received = match rx.take() {
            Some(rx) => match rx.recv() {
                Ok(result) => result.map_err(Arc::new),
                Err(_) => Err(Arc::new(abandoned())),
            },
            // another waiter resolved it while we queued on the lock
            None => return self.outcome.get_or_init(|| Err(Arc::new(abandoned()))),
        };
        self.outcome.get_or_init(|| received)
    }
}

fn abandoned() -> Error {
    Error::Inference("request dropped without completing".to_owned())
}
