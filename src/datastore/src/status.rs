// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Store status publication.

use std::sync::Mutex;

use beacon_broadcast::{Broadcaster, Subscriber};

use crate::types::DataStoreStatus;

/// Holds the last published [`DataStoreStatus`] and fans out transitions.
///
/// This is the read-side facade applications use to watch for store outages:
/// poll [`DataStoreStatusManager::status`] or subscribe for pushes. Only the
/// persistent-store wrapper publishes into it; stores without status
/// monitoring never hand one out.
#[derive(Debug)]
pub struct DataStoreStatusManager {
    status: Mutex<DataStoreStatus>,
    broadcaster: Broadcaster<DataStoreStatus>,
}

impl DataStoreStatusManager {
    pub fn new() -> DataStoreStatusManager {
        DataStoreStatusManager {
            status: Mutex::new(DataStoreStatus::HEALTHY),
            broadcaster: Broadcaster::new(),
        }
    }

    /// The current status snapshot.
    pub fn status(&self) -> DataStoreStatus {
        *self.status.lock().expect("lock poisoned")
    }

    /// Attaches a status listener.
    pub fn subscribe(&self) -> Subscriber<DataStoreStatus> {
        self.broadcaster.subscribe()
    }

    /// Detaches a status listener and closes its channel.
    pub fn unsubscribe(&self, subscriber: Subscriber<DataStoreStatus>) {
        self.broadcaster.unsubscribe(subscriber)
    }

    /// Publishes `new` if it differs from the current status. Returns whether
    /// a transition happened.
    ///
    /// Intended for the store implementation that owns this manager; readers
    /// have no business calling it.
    pub fn update(&self, new: DataStoreStatus) -> bool {
        {
            let mut status = self.status.lock().expect("lock poisoned");
            if *status == new {
                return false;
            }
            *status = new;
        }
        // Delivery happens outside the status lock.
        self.broadcaster.broadcast(new);
        true
    }

    pub(crate) fn close(&self) {
        self.broadcaster.close();
    }
}

impl Default for DataStoreStatusManager {
    fn default() -> DataStoreStatusManager {
        DataStoreStatusManager::new()
    }
}
