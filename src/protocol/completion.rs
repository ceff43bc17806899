//! Completion routing for async front-ends
//!
//! The circuit layer is synchronous and event-driven; front-ends like a
//! SOCKS server want to `await` milestones such as "circuit open" or
//! "stream connected". This router hands out oneshot receivers and
//! resolves them from the circuit's event stream, so no caller ever holds
//! a borrow of the circuit across an await point.

use std::collections::HashMap;

use futures::channel::oneshot;

use crate::error::{Error, Result};

use super::circuit::CircuitEvent;
use super::stream::StreamId;

/// Routes circuit events to waiting oneshot completions.
#[derive(Default)]
pub struct CompletionRouter {
    open_waiters: Vec<oneshot::Sender<Result<()>>>,
    connect_waiters: HashMap<StreamId, oneshot::Sender<Result<()>>>,
}

impl CompletionRouter {
    pub fn new() -> Self {
        Self {
            open_waiters: Vec::new(),
            connect_waiters: HashMap::new(),
        }
    }

    /// A future resolving when the circuit opens (or dies first).
    pub fn await_open(&mut self) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.open_waiters.push(tx);
        rx
    }

    /// A future resolving when `stream_id` sees CONNECTED (or fails
    /// first).
    pub fn await_connected(&mut self, stream_id: StreamId) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        // A second waiter for the same stream replaces the first; the old
        // receiver observes cancellation.
        self.connect_waiters.insert(stream_id, tx);
        rx
    }

    /// Feed one circuit event through the router.
    pub fn dispatch(&mut self, event: &CircuitEvent) {
        match event {
            CircuitEvent::Opened => {
                for waiter in self.open_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            CircuitEvent::StreamConnected { stream_id } => {
                if let Some(waiter) = self.connect_waiters.remove(stream_id) {
                    let _ = waiter.send(Ok(()));
                }
            }
            CircuitEvent::StreamEnded { stream_id, reason } => {
                if let Some(waiter) = self.connect_waiters.remove(stream_id) {
                    let _ = waiter.send(Err(Error::Stream(format!(
                        "stream ended before connecting (reason {})",
                        reason
                    ))));
                }
            }
            CircuitEvent::Destroyed { reason, .. } => {
                self.fail_all(Error::CircuitDestroyed(*reason));
            }
            CircuitEvent::StreamData { .. } => {}
        }
    }

    /// Resolve every outstanding waiter with `err`. Used on circuit or
    /// link death and on cancellation.
    pub fn fail_all(&mut self, err: Error) {
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        for (_, waiter) in self.connect_waiters.drain() {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    pub fn pending(&self) -> usize {
        self.open_waiters.len() + self.connect_waiters.len()
    }
}
