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

//! The composition root (C8): starts the three background workers, hands
//! out `SessionHandle`s backed by a generation-checked arena instead of
//! `Arc` cycles, and tears everything down idempotently on `shutdown`.

use std::{
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use rum_protocol::ServerConfig;
use tracing::info;

use crate::{
    cache::{evictor, BeaconCache},
    consts,
    providers::Providers,
    sender::{self, SenderConfig, SenderContext},
    session::proxy::SessionProxy,
    sync::ShutdownSignal,
    watchdog::{ProxyHandle, Watchdog, WatchdogEvent},
};

/// Handle returned to instrumentation code. Re-validated against the arena
/// slot's generation on every call; a stale handle (slot freed and possibly
/// reused) behaves as a silent no-op rather than panicking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    index: usize,
    generation: u64,
}

struct Slot {
    proxy: Arc<Mutex<SessionProxy>>,
    generation: u64,
}

struct Arena {
    slots: Vec<Option<Slot>>,
    free_list: Vec<usize>,
    next_generation: u64,
}

impl Arena {
    fn new() -> Self {
        Arena { slots: Vec::new(), free_list: Vec::new(), next_generation: 1 }
    }

    fn insert(&mut self, proxy: Arc<Mutex<SessionProxy>>) -> SessionHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        let slot = Slot { proxy, generation };
        let index = match self.free_list.pop() {
            Some(i) => {
                self.slots[i] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        SessionHandle { index, generation }
    }

    fn get(&self, handle: SessionHandle) -> Option<Arc<Mutex<SessionProxy>>> {
        let slot = self.slots.get(handle.index)?.as_ref()?;
        if slot.generation != handle.generation {
            return None;
        }
        Some(slot.proxy.clone())
    }

    fn remove(&mut self, handle: SessionHandle) {
        if let Some(slot) = self.slots.get(handle.index).and_then(|s| s.as_ref()) {
            if slot.generation == handle.generation {
                self.slots[handle.index] = None;
                self.free_list.push(handle.index);
            }
        }
    }

    fn all_handles(&self) -> Vec<SessionHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|s| SessionHandle { index, generation: s.generation }))
            .collect()
    }
}

pub struct FacadeConfig {
    pub app_id: String,
    pub app_version: String,
    pub endpoint_default_config: ServerConfig,
    pub eviction_lower_bound: i64,
    pub eviction_upper_bound: i64,
    pub max_record_age_ms: i64,
    pub eviction_interval: Duration,
}

/// Top-level handle a host application owns for the lifetime of the
/// process (or its own embedding lifetime). `initialize`/`shutdown` are
/// idempotent; calls after `shutdown` are silent no-ops.
pub struct Facade {
    providers: Providers,
    cache: Arc<BeaconCache>,
    sender_ctx: Arc<SenderContext>,
    watchdog: Arc<Watchdog>,
    shutdown: Arc<ShutdownSignal>,
    arena: Mutex<Arena>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: Mutex<bool>,
    shut_down: Mutex<bool>,
    eviction_config: evictor::EvictorConfig,
}

impl Facade {
    pub fn new(providers: Providers, config: FacadeConfig) -> Self {
        let cache = Arc::new(BeaconCache::new());
        let sender_ctx = Arc::new(SenderContext::new(
            cache.clone(),
            providers.clock.clone(),
            providers.http_client.clone(),
            SenderConfig {
                app_id: config.app_id,
                app_version: config.app_version,
                default_server_config: config.endpoint_default_config,
            },
        ));
        let eviction_config = evictor::EvictorConfig {
            lower_bound: config.eviction_lower_bound,
            upper_bound: config.eviction_upper_bound,
            max_record_age_ms: config.max_record_age_ms,
            interval: config.eviction_interval,
        };
        Facade {
            providers,
            cache,
            sender_ctx,
            watchdog: Arc::new(Watchdog::new()),
            shutdown: Arc::new(ShutdownSignal::new()),
            arena: Mutex::new(Arena::new()),
            workers: Mutex::new(Vec::new()),
            started: Mutex::new(false),
            shut_down: Mutex::new(false),
            eviction_config,
        }
    }

    /// Start the evictor, sender, and watchdog threads. Idempotent.
    pub fn initialize(&self) {
        let mut started = self.started.lock().unwrap();
        if *started {
            return;
        }
        *started = true;
        drop(started);

        let mut workers = self.workers.lock().unwrap();

        let cache = self.cache.clone();
        let clock = self.providers.clock.clone();
        let config = evictor::EvictorConfig {
            lower_bound: self.eviction_config.lower_bound,
            upper_bound: self.eviction_config.upper_bound,
            max_record_age_ms: self.eviction_config.max_record_age_ms,
            interval: self.eviction_config.interval,
        };
        let shutdown = self.shutdown.clone();
        workers.push(std::thread::spawn(move || evictor::run(cache, clock, config, shutdown)));

        let sender_ctx = self.sender_ctx.clone();
        let shutdown = self.shutdown.clone();
        workers.push(std::thread::spawn(move || sender::run(sender_ctx, shutdown)));

        let watchdog = self.watchdog.clone();
        let clock = self.providers.clock.clone();
        let shutdown = self.shutdown.clone();
        workers.push(std::thread::spawn(move || watchdog.run(clock, consts::WATCHDOG_DEFAULT_SLEEP, shutdown)));

        info!("facade initialized");
    }

    pub fn wait_for_init(&self, timeout: Duration) -> bool {
        if *self.shut_down.lock().unwrap() {
            return false;
        }
        self.sender_ctx.wait_for_init(timeout)
    }

    /// Create a new session, registering it with the sender and the
    /// watchdog. Returns a null-object-like handle after shutdown: the
    /// returned proxy exists but is immediately ended, so every
    /// instrumentation call on it is a silent no-op.
    pub fn create_session(&self) -> SessionHandle {
        let proxy = SessionProxy::new(
            self.providers.prng.as_ref(),
            self.cache.clone(),
            self.providers.clock.clone(),
            self.sender_ctx.config.default_server_config,
        );
        let proxy = Arc::new(Mutex::new(proxy));

        if *self.shut_down.lock().unwrap() {
            proxy.lock().unwrap().end();
            return self.arena.lock().unwrap().insert(proxy);
        }

        let handle = self.arena.lock().unwrap().insert(proxy.clone());
        self.sender_ctx.register_session(handle.index as ProxyHandle, proxy.clone());
        self.watchdog.register(handle.index as ProxyHandle, proxy.clone());
        let now = self.providers.clock.now_ms();
        let at_ms = proxy
            .lock()
            .unwrap()
            .next_split_deadline_ms()
            .unwrap_or(now + consts::WATCHDOG_DEFAULT_SLEEP.as_millis() as i64);
        let _ = self.watchdog.sender().send(WatchdogEvent::Track { handle: handle.index, at_ms });
        handle
    }

    pub fn with_session<R>(&self, handle: SessionHandle, f: impl FnOnce(&mut SessionProxy) -> R) -> Option<R> {
        let proxy = self.arena.lock().unwrap().get(handle)?;
        let mut proxy = proxy.lock().unwrap();
        Some(f(&mut proxy))
    }

    pub fn end_session(&self, handle: SessionHandle) {
        if let Some(proxy) = self.arena.lock().unwrap().get(handle) {
            proxy.lock().unwrap().end();
        }
        self.watchdog.unregister(handle.index as ProxyHandle);
        let _ = self.watchdog.sender().send(WatchdogEvent::Untrack { handle: handle.index });
        self.arena.lock().unwrap().remove(handle);
    }

    pub fn cache(&self) -> &Arc<BeaconCache> {
        &self.cache
    }

    /// Signal all three workers, join with bounded timeouts, and tear down
    /// every remaining session in reverse-creation order. Idempotent.
    pub fn shutdown(&self) {
        let mut shut_down = self.shut_down.lock().unwrap();
        if *shut_down {
            return;
        }
        *shut_down = true;
        drop(shut_down);

        self.shutdown.request();

        let handles: Vec<SessionHandle> = {
            let mut h = self.arena.lock().unwrap().all_handles();
            h.reverse();
            h
        };
        for handle in handles {
            if let Some(proxy) = self.arena.lock().unwrap().get(handle) {
                proxy.lock().unwrap().end();
            }
        }

        let mut workers = self.workers.lock().unwrap();
        // evictor, sender, watchdog were pushed in that order; give the
        // sender the longest budget since it may be mid-flush.
        let budgets = [consts::DEFAULT_EVICTION_INTERVAL, consts::SENDER_JOIN_TIMEOUT, consts::WATCHDOG_JOIN_TIMEOUT];
        for (worker, budget) in workers.drain(..).zip(budgets) {
            join_with_timeout(worker, budget);
        }
        info!("facade shut down");
    }
}

/// `JoinHandle::join` has no built-in timeout; we approximate one by
/// polling `is_finished` rather than blocking indefinitely on a worker that
/// missed its own shutdown check.
fn join_with_timeout(worker: JoinHandle<()>, budget: Duration) {
    let start = std::time::Instant::now();
    while !worker.is_finished() && start.elapsed() < budget {
        std::thread::sleep(Duration::from_millis(10));
    }
    if worker.is_finished() {
        let _ = worker.join();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::providers::{CountingThreadId, SystemPrng, TestClock};
    use rum_protocol::{BeaconRequest, HttpClient, HttpResponse, StatusRequest};

    struct NullHttp;
    impl HttpClient for NullHttp {
        fn send_status_request(&self, _req: &StatusRequest) -> anyhow::Result<HttpResponse> {
            Ok(HttpResponse { status: 200, headers: Default::default(), body: b"cp=0".to_vec() })
        }
        fn send_new_session_request(&self, req: &StatusRequest) -> anyhow::Result<HttpResponse> {
            self.send_status_request(req)
        }
        fn send_beacon_request(&self, _req: &BeaconRequest) -> anyhow::Result<HttpResponse> {
            Ok(HttpResponse { status: 200, headers: Default::default(), body: Vec::new() })
        }
    }

    fn test_providers() -> Providers {
        Providers {
            clock: Arc::new(TestClock::new(0)),
            prng: Arc::new(SystemPrng),
            thread_id: Arc::new(CountingThreadId::new()),
            http_client: Arc::new(NullHttp),
        }
    }

    fn test_config() -> FacadeConfig {
        FacadeConfig {
            app_id: "app".into(),
            app_version: "1.0".into(),
            endpoint_default_config: ServerConfig::default(),
            eviction_lower_bound: 1000,
            eviction_upper_bound: 2000,
            max_record_age_ms: 0,
            eviction_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn create_session_then_stale_handle_is_none_after_end() {
        let facade = Arc::new(Facade::new(test_providers(), test_config()));
        let handle = facade.create_session();
        assert!(facade.with_session(handle, |_| ()).is_some());

        facade.end_session(handle);
        assert!(facade.with_session(handle, |_| ()).is_none());
    }

    #[test]
    fn reused_slot_does_not_satisfy_stale_handle() {
        let facade = Arc::new(Facade::new(test_providers(), test_config()));
        let first = facade.create_session();
        facade.end_session(first);
        let second = facade.create_session();

        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);
        assert!(facade.with_session(first, |_| ()).is_none());
        assert!(facade.with_session(second, |_| ()).is_some());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let facade = Arc::new(Facade::new(test_providers(), test_config()));
        facade.initialize();
        facade.shutdown();
        facade.shutdown();
    }
}
