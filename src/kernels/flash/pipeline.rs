// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Two-stage load/compute pipeline.
//!
//! The load stage runs on a scoped thread and pushes items into a bounded
//! queue; the compute stage drains the queue on the calling thread. Queue
//! capacity plays the role of the shared-memory buffer count: the load stage
//! can run at most `capacity` items ahead.

use std::any::Any;
use std::sync::mpsc::{self, SyncSender};

use crate::error::{FlashbenchError, Result};

/// Handle the load stage pushes items through.
#[derive(Debug)]
pub struct Producer<T> {
    tx: SyncSender<T>,
}

impl<T> Producer<T> {
    /// Hand an item to the compute stage, blocking while the queue is full.
    ///
    /// Returns `false` once the compute stage has stopped listening.
    pub fn push(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }
}

/// Run `produce` and `consume` as a bounded two-stage pipeline.
///
/// `consume` receives the items in the order they were pushed. The queue is
/// closed when `produce` returns.
///
/// # Errors
///
/// Returns [`FlashbenchError::InvalidConfig`] for a zero capacity, the error
/// returned by `produce`, or [`FlashbenchError::Kernel`] if the load stage
/// panics.
pub fn run_pipelined<T, P, C, R>(capacity: usize, produce: P, consume: C) -> Result<R>
where
    T: Send,
    P: FnOnce(Producer<T>) -> Result<()> + Send,
    C: FnOnce(mpsc::Iter<'_, T>) -> R,
{
    if capacity == 0 {
        return Err(FlashbenchError::InvalidConfig(
            "pipeline capacity must be at least 1".to_string(),
        ));
    }

    let (tx, rx) = mpsc::sync_channel(capacity);
    std::thread::scope(move |scope| {
        let loader = scope.spawn(move || produce(Producer { tx }));
        let result = consume(rx.iter());
        // Unblock a load stage that is still pushing.
        drop(rx);
        loader.join().map_err(|payload| {
            FlashbenchError::Kernel(format!("load stage panicked: {}", panic_message(&*payload)))
        })??;
        Ok(result)
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
