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

//! The session watchdog (C7): a dedicated thread that wakes at the nearest
//! known deadline across all open proxies rather than polling on a fixed
//! tick, using a min-heap of `(deadline, generation, handle)` entries and a
//! generation counter per handle so a stale heap entry for a proxy that has
//! already split or closed is cheaply recognized and dropped.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BinaryHeap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, instrument, span, Level};

use crate::{providers::Clock, session::proxy::SessionProxy, sync::ShutdownSignal, test_hooks};

/// Opaque identity the facade hands the watchdog for one proxy slot. The
/// facade's arena index is reused here so the watchdog never needs its own
/// id allocator.
pub type ProxyHandle = usize;

struct Deadline {
    at_ms: i64,
    generation: u64,
    handle: ProxyHandle,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at_ms == other.at_ms
    }
}
impl Eq for Deadline {}

/// Reversed so the heap pops the *smallest* `at_ms` first, matching
/// `BinaryHeap`'s max-heap default inverted into a min-heap.
impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.at_ms.cmp(&self.at_ms)
    }
}
impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Message the facade sends whenever it registers a new proxy or bumps an
/// existing one's deadline (e.g. after a manual split or a config change
/// that alters the session timeout).
pub enum WatchdogEvent {
    Track { handle: ProxyHandle, at_ms: i64 },
    Untrack { handle: ProxyHandle },
}

pub struct Watchdog {
    proxies: Mutex<HashMap<ProxyHandle, Arc<Mutex<SessionProxy>>>>,
    events_tx: Sender<WatchdogEvent>,
    events_rx: Receiver<WatchdogEvent>,
}

impl Watchdog {
    pub fn new() -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Watchdog { proxies: Mutex::new(HashMap::new()), events_tx, events_rx }
    }

    pub fn sender(&self) -> Sender<WatchdogEvent> {
        self.events_tx.clone()
    }

    pub fn register(&self, handle: ProxyHandle, proxy: Arc<Mutex<SessionProxy>>) {
        self.proxies.lock().unwrap().insert(handle, proxy);
    }

    pub fn unregister(&self, handle: ProxyHandle) {
        self.proxies.lock().unwrap().remove(&handle);
    }

    /// Run the watchdog loop on a dedicated thread. Wakes on whichever comes
    /// first: a new tracking event, the nearest deadline, or the fallback
    /// sleep when the heap is empty.
    #[instrument(skip_all)]
    pub fn run(&self, clock: Arc<dyn Clock>, fallback_sleep: Duration, shutdown: Arc<ShutdownSignal>) {
        let _s = span!(Level::INFO, "watchdog").entered();
        let mut heap: BinaryHeap<Deadline> = BinaryHeap::new();
        let mut generations: HashMap<ProxyHandle, u64> = HashMap::new();

        loop {
            if shutdown.is_requested() {
                info!("watchdog exiting on shutdown");
                return;
            }

            while let Ok(event) = self.events_rx.try_recv() {
                match event {
                    WatchdogEvent::Track { handle, at_ms } => {
                        let gen = generations.entry(handle).or_insert(0);
                        *gen += 1;
                        heap.push(Deadline { at_ms, generation: *gen, handle });
                    }
                    WatchdogEvent::Untrack { handle } => {
                        generations.remove(&handle);
                    }
                }
            }

            let now = clock.now_ms();
            while let Some(top) = heap.peek() {
                if top.at_ms > now {
                    break;
                }
                let due = heap.pop().unwrap();
                let Some(&current_gen) = generations.get(&due.handle) else {
                    continue; // untracked since this deadline was queued
                };
                if due.generation != current_gen {
                    continue; // stale entry, superseded by a later Track
                }
                // Re-arm unconditionally: either the proxy reports its real
                // next split time, or (no time trigger currently enabled,
                // or the proxy is gone) we fall back to a periodic re-check
                // so a later config change that enables one is still seen.
                let next_at = self.fire(due.handle, now).unwrap_or(now + fallback_sleep.as_millis() as i64);
                let gen = generations.get_mut(&due.handle).unwrap();
                *gen += 1;
                heap.push(Deadline { at_ms: next_at, generation: *gen, handle: due.handle });
            }

            let sleep_for = match heap.peek() {
                Some(top) => Duration::from_millis((top.at_ms - now).max(0) as u64).min(fallback_sleep),
                None => fallback_sleep,
            };
            test_hooks::emit("watchdog:tick");
            if shutdown.sleep(sleep_for) {
                info!("watchdog exiting on shutdown");
                return;
            }
        }
    }

    /// Check a due proxy for a timeout split and report when it should next
    /// be reconsidered. Returns `None` if the proxy is no longer registered.
    fn fire(&self, handle: ProxyHandle, now_ms: i64) -> Option<i64> {
        let proxies = self.proxies.lock().unwrap();
        let proxy_arc = proxies.get(&handle)?;
        let mut proxy = proxy_arc.lock().unwrap();
        if proxy.split_if_due(now_ms) {
            debug!(handle, "watchdog split session on timeout");
        }
        proxy.next_split_deadline_ms()
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{cache::BeaconCache, providers::{Prng, TestClock}};
    use rum_protocol::ServerConfig;

    struct FixedPrng(u32);
    impl Prng for FixedPrng {
        fn next_u32(&self) -> u32 {
            self.0
        }
    }

    #[test]
    fn heap_orders_nearest_deadline_first() {
        let mut heap: BinaryHeap<Deadline> = BinaryHeap::new();
        heap.push(Deadline { at_ms: 500, generation: 1, handle: 1 });
        heap.push(Deadline { at_ms: 100, generation: 1, handle: 2 });
        heap.push(Deadline { at_ms: 300, generation: 1, handle: 3 });

        assert_eq!(heap.pop().unwrap().handle, 2);
        assert_eq!(heap.pop().unwrap().handle, 3);
        assert_eq!(heap.pop().unwrap().handle, 1);
    }

    #[test]
    fn fire_splits_a_proxy_past_its_idle_deadline() {
        let watchdog = Watchdog::new();
        let cache = Arc::new(BeaconCache::new());
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new(0));
        let prng = FixedPrng(1);
        let mut cfg = ServerConfig::default();
        cfg.session_timeout_ms = 1000;

        let mut proxy = SessionProxy::new(&prng, cache, clock, ServerConfig::default());
        proxy.apply_server_config(cfg);
        let first_key = proxy.current_key();
        let proxy_arc = Arc::new(Mutex::new(proxy));

        watchdog.register(1, proxy_arc.clone());
        watchdog.fire(1, 1000);

        assert_ne!(proxy_arc.lock().unwrap().current_key(), first_key);
    }

    #[test]
    fn stale_generation_is_skipped() {
        let watchdog = Watchdog::new();
        watchdog.events_tx.send(WatchdogEvent::Track { handle: 1, at_ms: 100 }).unwrap();
        watchdog.events_tx.send(WatchdogEvent::Track { handle: 1, at_ms: 200 }).unwrap();

        // draining manually mirrors what run()'s event loop does, without
        // spinning up a real thread for this assertion.
        let mut heap: BinaryHeap<Deadline> = BinaryHeap::new();
        let mut generations: HashMap<ProxyHandle, u64> = HashMap::new();
        while let Ok(event) = watchdog.events_rx.try_recv() {
            if let WatchdogEvent::Track { handle, at_ms } = event {
                let gen = generations.entry(handle).or_insert(0);
                *gen += 1;
                heap.push(Deadline { at_ms, generation: *gen, handle });
            }
        }
        assert_eq!(generations[&1], 2);
        let first = heap.pop().unwrap();
        assert_eq!(first.at_ms, 100);
        assert_ne!(first.generation, generations[&1]);
    }
}
