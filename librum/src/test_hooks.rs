// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// tooling gets confused by the conditional compilation
#![allow(dead_code)]

// The test_hooks module lets tests synchronize on named lifecycle events
// (state transitions, eviction passes, splits) emitted by the background
// workers, instead of relying on sleeps. Since the core runs embedded in a
// single process rather than split across a client/daemon boundary, the
// event bus is an in-process broadcast channel rather than a unix socket.
use std::sync::Mutex;

use tracing::info;

#[cfg(feature = "test_hooks")]
pub fn emit(event: &str) {
    EVENT_BUS.emit(event);
}

#[cfg(not(feature = "test_hooks"))]
pub fn emit(_event: &str) {
    // a no-op normally
}

#[cfg(feature = "test_hooks")]
pub fn scoped(event: &str) -> ScopedEvent {
    ScopedEvent::new(event)
}

#[cfg(not(feature = "test_hooks"))]
pub fn scoped(_event: &str) {}

/// ScopedEvent emits an event when it goes out of scope.
pub struct ScopedEvent<'a> {
    event: &'a str,
}

impl<'a> ScopedEvent<'a> {
    pub fn new(event: &'a str) -> Self {
        ScopedEvent { event }
    }
}

impl std::ops::Drop for ScopedEvent<'_> {
    fn drop(&mut self) {
        emit(self.event);
    }
}

lazy_static::lazy_static! {
    pub static ref EVENT_BUS: EventBus = EventBus::new();
}

/// Broadcasts named events to every subscriber registered via `subscribe`.
/// Tests call `subscribe` for the events they care about, then block on the
/// returned receiver instead of sleeping an arbitrary amount of time.
pub struct EventBus {
    subscribers: Mutex<Vec<(String, crossbeam_channel::Sender<()>)>>,
}

impl EventBus {
    fn new() -> Self {
        EventBus { subscribers: Mutex::new(Vec::new()) }
    }

    /// Register interest in `event`, returning a receiver that fires once
    /// per matching `emit` call made after this call returns.
    pub fn subscribe(&self, event: &str) -> crossbeam_channel::Receiver<()> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().unwrap().push((event.to_string(), tx));
        rx
    }

    fn emit(&self, event: &str) {
        info!("test_hooks: emitting event '{}'", event);
        let subscribers = self.subscribers.lock().unwrap();
        for (want, tx) in subscribers.iter() {
            if want == event {
                let _ = tx.send(());
            }
        }
    }
}
