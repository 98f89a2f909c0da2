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

//! Session and SessionProxy (C5): a Session wraps a `BeaconKey` and feeds
//! instrumentation records into the cache; a SessionProxy is the
//! user-visible handle that owns a chain of Sessions produced by splits.

pub mod creator;
pub mod proxy;

use std::sync::Arc;

use rum_protocol::{BeaconKey, ServerConfig};

use crate::{beacon, cache::BeaconCache, providers::Clock};

/// `SessionState` is derived from two flags rather than stored directly, so
/// it can never drift out of sync with `configured`/`finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotConfigured,
    Configured,
    Finished,
    ConfiguredAndFinished,
    ConfiguredAndOpen,
}

/// One underlying session: a `BeaconKey`, the cache it writes into, and the
/// bookkeeping instrumentation calls update directly.
pub struct Session {
    key: BeaconKey,
    cache: Arc<BeaconCache>,
    clock: Arc<dyn Clock>,
    configured: bool,
    finished: bool,
    server_config: ServerConfig,
    event_count: i32,
    created_at_ms: i64,
    last_interaction_ms: i64,
}

impl Session {
    pub fn new(key: BeaconKey, cache: Arc<BeaconCache>, clock: Arc<dyn Clock>, default_config: ServerConfig) -> Self {
        let now = clock.now_ms();
        Session {
            key,
            cache,
            clock,
            configured: false,
            finished: false,
            server_config: default_config,
            event_count: 0,
            created_at_ms: now,
            last_interaction_ms: now,
        }
    }

    pub fn key(&self) -> BeaconKey {
        self.key
    }

    pub fn state(&self) -> SessionState {
        match (self.configured, self.finished) {
            (false, false) => SessionState::NotConfigured,
            (false, true) => SessionState::Finished,
            (true, false) => SessionState::ConfiguredAndOpen,
            (true, true) => SessionState::ConfiguredAndFinished,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn server_config(&self) -> &ServerConfig {
        &self.server_config
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn last_interaction_ms(&self) -> i64 {
        self.last_interaction_ms
    }

    pub fn event_count(&self) -> i32 {
        self.event_count
    }

    /// Apply a server config. `configured` transitions to `true` exactly
    /// once, on the first call; subsequent calls only update the config
    /// value (merged, newer-wins per field group).
    pub fn apply_server_config(&mut self, config: ServerConfig) {
        self.server_config = self.server_config.merge(&config);
        self.configured = true;
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    fn touch(&mut self) {
        self.last_interaction_ms = self.clock.now_ms();
    }

    pub fn report_event(&mut self, name: &str) {
        self.touch();
        let ts = self.clock.now_ms();
        self.cache.add_event(self.key, ts, beacon::encode_event(name, ts));
    }

    pub fn report_value(&mut self, name: &str, value: &str) {
        self.touch();
        let ts = self.clock.now_ms();
        self.cache.add_event(self.key, ts, beacon::encode_value(name, value, ts));
    }

    pub fn report_error(&mut self, name: &str, code: i32, reason: &str) {
        self.touch();
        let ts = self.clock.now_ms();
        self.cache.add_event(self.key, ts, beacon::encode_error(name, code, reason, ts));
    }

    pub fn report_crash(&mut self, name: &str, reason: &str, stacktrace: &str) {
        self.touch();
        let ts = self.clock.now_ms();
        self.cache.add_event(self.key, ts, beacon::encode_crash(name, reason, stacktrace, ts));
    }

    pub fn identify_user(&mut self, tag: &str) {
        self.touch();
        let ts = self.clock.now_ms();
        self.cache.add_event(self.key, ts, beacon::encode_identify_user(tag, ts));
    }

    /// Record a completed top-level action. Returns the new event count so
    /// the proxy can decide whether an event-count split is due.
    pub fn enter_action(&mut self, name: &str, start_ms: i64, duration_ms: i64) -> i32 {
        self.touch();
        self.cache.add_action(self.key, start_ms, beacon::encode_action("action", name, start_ms, duration_ms));
        self.event_count += 1;
        self.event_count
    }

    pub fn trace_web_request(&mut self, url: &str, response_code: Option<i32>, start_ms: i64, duration_ms: i64) {
        self.touch();
        self.cache.add_event(
            self.key,
            start_ms,
            beacon::encode_web_request(url, response_code, start_ms, duration_ms),
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::providers::TestClock;

    fn new_session() -> Session {
        let cache = Arc::new(BeaconCache::new());
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new(1000));
        Session::new(BeaconKey::new(1, 0), cache, clock, ServerConfig::default())
    }

    #[test]
    fn starts_not_configured_and_open() {
        let s = new_session();
        assert_eq!(s.state(), SessionState::NotConfigured);
    }

    #[test]
    fn apply_server_config_transitions_once() {
        let mut s = new_session();
        s.apply_server_config(ServerConfig::default());
        assert_eq!(s.state(), SessionState::ConfiguredAndOpen);
        s.apply_server_config(ServerConfig::default());
        assert_eq!(s.state(), SessionState::ConfiguredAndOpen);
    }

    #[test]
    fn finish_after_configure_is_configured_and_finished() {
        let mut s = new_session();
        s.apply_server_config(ServerConfig::default());
        s.finish();
        assert_eq!(s.state(), SessionState::ConfiguredAndFinished);
    }

    #[test]
    fn enter_action_increments_event_count() {
        let mut s = new_session();
        assert_eq!(s.enter_action("a", 0, 10), 1);
        assert_eq!(s.enter_action("b", 10, 10), 2);
        assert_eq!(s.event_count(), 2);
    }
}
