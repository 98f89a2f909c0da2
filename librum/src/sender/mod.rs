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

//! The sender state machine (C6): owns the live-session registry and
//! cycles through `SenderState`s on a dedicated thread until it reaches
//! `Terminal`.

pub mod state;

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
};

use rum_protocol::{HttpClient, ServerConfig};
use tracing::{info, instrument, span, Level};

use crate::{
    cache::BeaconCache,
    providers::Clock,
    session::proxy::SessionProxy,
    sync::ShutdownSignal,
    test_hooks,
    watchdog::ProxyHandle,
};
use state::SenderStateKind;

/// Tracking record the sender keeps per live `SessionProxy`, independent of
/// the proxy's own bookkeeping, so the sender can decide what to flush
/// without taking the proxy's lock for every key it owns.
///
/// Keyed by `ProxyHandle` rather than `BeaconKey`: a proxy's key changes on
/// every split, so the sender must track the *proxy* and ask it for its
/// current key and its chain of finished-but-unflushed keys on every tick.
pub struct TrackedSession {
    pub proxy: Arc<Mutex<SessionProxy>>,
    pub ever_configured: bool,
}

pub struct SenderConfig {
    pub app_id: String,
    pub app_version: String,
    pub default_server_config: ServerConfig,
}

/// State shared between the sender thread and the rest of the process:
/// instrumentation registers/unregisters sessions here; `wait_for_init`
/// blocks on the init latch.
pub struct SenderContext {
    pub cache: Arc<BeaconCache>,
    pub clock: Arc<dyn Clock>,
    pub http: Arc<dyn HttpClient>,
    pub config: SenderConfig,
    pub sessions: Mutex<HashMap<ProxyHandle, TrackedSession>>,
    pub server_config: Mutex<ServerConfig>,
    pub last_open_send_time_ms: Mutex<i64>,
    pub last_status_check_ms: Mutex<i64>,
    init_lock: Mutex<bool>,
    init_cond: Condvar,
}

impl SenderContext {
    pub fn new(cache: Arc<BeaconCache>, clock: Arc<dyn Clock>, http: Arc<dyn HttpClient>, config: SenderConfig) -> Self {
        let default_server_config = config.default_server_config;
        SenderContext {
            cache,
            clock,
            http,
            config,
            sessions: Mutex::new(HashMap::new()),
            server_config: Mutex::new(default_server_config),
            last_open_send_time_ms: Mutex::new(0),
            last_status_check_ms: Mutex::new(0),
            init_lock: Mutex::new(false),
            init_cond: Condvar::new(),
        }
    }

    pub fn register_session(&self, handle: ProxyHandle, proxy: Arc<Mutex<SessionProxy>>) {
        self.sessions.lock().unwrap().insert(handle, TrackedSession { proxy, ever_configured: false });
    }

    pub fn unregister_session(&self, handle: ProxyHandle) {
        self.sessions.lock().unwrap().remove(&handle);
    }

    pub fn mark_init_complete(&self) {
        let mut done = self.init_lock.lock().unwrap();
        *done = true;
        self.init_cond.notify_all();
    }

    /// Block until `mark_init_complete` is called or `timeout` elapses.
    /// Returns `false` on timeout.
    pub fn wait_for_init(&self, timeout: std::time::Duration) -> bool {
        let done = self.init_lock.lock().unwrap();
        if *done {
            return true;
        }
        let (_done, result) = self.init_cond.wait_timeout_while(done, timeout, |d| !*d).unwrap();
        !result.timed_out()
    }
}

/// Run the sender loop on a dedicated thread until `Terminal`.
#[instrument(skip_all)]
pub fn run(ctx: Arc<SenderContext>, shutdown: Arc<ShutdownSignal>) {
    let _s = span!(Level::INFO, "sender").entered();
    let mut current = SenderStateKind::Initial;
    loop {
        if shutdown.is_requested() {
            current = current.shutdown_state();
        }
        current = state::dispatch(&current, &ctx, &shutdown);
        test_hooks::emit("sender:tick");
        if current.is_terminal() {
            info!("sender reached terminal state");
            return;
        }
    }
}
