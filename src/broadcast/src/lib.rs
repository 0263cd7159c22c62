// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Multi-listener event fan-out.
//!
//! A [`Broadcaster`] delivers each broadcast value to every attached
//! listener over a small bounded channel. Listeners are treated as bounded
//! consumers: a listener that has fallen behind loses the value for that
//! broadcast rather than blocking the publisher or the other listeners.
//! Applications that need lossless consumption must consume promptly or
//! attach before expected bursts.
//!
//! All operations are safe under concurrent callers. Delivery happens after
//! the registry lock is released, so a subscriber can call back into the
//! broadcaster from its receive loop without deadlocking.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default per-listener buffer capacity.
const DEFAULT_CAPACITY: usize = 10;

/// Fan-out of cloned values to any number of subscribers.
#[derive(Debug)]
pub struct Broadcaster<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

#[derive(Debug)]
struct Inner<T> {
    next_id: u64,
    senders: BTreeMap<u64, mpsc::Sender<T>>,
    closed: bool,
}

/// A listener handle returned by [`Broadcaster::subscribe`].
///
/// Dropping the subscriber detaches it implicitly; the broadcaster prunes
/// the dead channel on the next broadcast.
#[derive(Debug)]
pub struct Subscriber<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscriber<T> {
    /// Receives the next value, or `None` once the subscriber has been
    /// removed (or the broadcaster closed) and the buffer is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`Subscriber::recv`].
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new() -> Broadcaster<T> {
        Broadcaster::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a broadcaster whose listeners buffer up to `capacity` values.
    /// Capacities below 1 are rounded up to 1.
    pub fn with_capacity(capacity: usize) -> Broadcaster<T> {
        Broadcaster {
            inner: Mutex::new(Inner {
                next_id: 0,
                senders: BTreeMap::new(),
                closed: false,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Attaches a new listener.
    ///
    /// Subscribing to a closed broadcaster returns a subscriber whose channel
    /// is already closed, so `recv` immediately yields `None`.
    pub fn subscribe(&self) -> Subscriber<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut inner = self.inner.lock().expect("lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.senders.insert(id, tx);
        }
        Subscriber { id, rx }
    }

    /// Detaches a listener and closes its channel.
    pub fn unsubscribe(&self, subscriber: Subscriber<T>) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.senders.remove(&subscriber.id);
    }

    /// Delivers `value` to every attached listener. Listeners whose buffers
    /// are full miss this value; listeners whose receivers were dropped are
    /// pruned.
    pub fn broadcast(&self, value: T) {
        let senders: Vec<(u64, mpsc::Sender<T>)> = {
            let inner = self.inner.lock().expect("lock poisoned");
            inner
                .senders
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };
        let mut dead = Vec::new();
        for (id, tx) in senders {
            match tx.try_send(value.clone()) {
                Ok(()) => {}
                // Drop-on-full: the listener keeps its place but misses this
                // value.
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            let mut inner = self.inner.lock().expect("lock poisoned");
            for id in dead {
                inner.senders.remove(&id);
            }
        }
    }

    /// Whether any listener is attached. O(1).
    pub fn has_listeners(&self) -> bool {
        let inner = self.inner.lock().expect("lock poisoned");
        !inner.senders.is_empty()
    }

    /// Detaches and closes every listener. Subsequent subscribes return
    /// already-closed subscribers; idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.closed = true;
        inner.senders.clear();
    }
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
    fn default() -> Broadcaster<T> {
        Broadcaster::new()
    }
}
