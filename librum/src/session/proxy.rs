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

//! `SessionProxy`: the handle instrumentation calls actually land on. It
//! owns the currently-open `Session` plus the `SessionCreator` that mints
//! the next one, and applies the three split triggers: event count (checked
//! inline, on every `enter_action`), idle timeout and max duration (computed
//! here but driven by the watchdog's periodic sweep), and an unconditional
//! split on crash reporting.

use std::sync::Arc;

use rum_protocol::{BeaconKey, ServerConfig};

use crate::{
    cache::BeaconCache,
    providers::{Clock, Prng},
    session::{creator::SessionCreator, Session},
};

pub struct SessionProxy {
    creator: SessionCreator,
    current: Session,
    user_tag: Option<String>,
    ended: bool,
    /// Keys of every session this proxy has already finished (via a split)
    /// but the sender hasn't yet flushed and cleared. A proxy's lifetime
    /// produces a *chain* of `BeaconKey`s, one per split; `current_key`
    /// only ever names the tail. Drained by the sender each tick.
    finished_keys: Vec<BeaconKey>,
}

impl SessionProxy {
    pub fn new(prng: &dyn Prng, cache: Arc<BeaconCache>, clock: Arc<dyn Clock>, default_config: ServerConfig) -> Self {
        let mut creator = SessionCreator::new(prng, cache, clock);
        let current = creator.create_session(default_config);
        SessionProxy { creator, current, user_tag: None, ended: false, finished_keys: Vec::new() }
    }

    pub fn current_key(&self) -> BeaconKey {
        self.current.key()
    }

    /// Take ownership of every finished-but-unflushed key in the chain,
    /// leaving the proxy's own list empty. The caller is now responsible
    /// for flushing and clearing each one.
    pub fn drain_finished_keys(&mut self) -> Vec<BeaconKey> {
        std::mem::take(&mut self.finished_keys)
    }

    /// Put keys back at the front of the chain, e.g. after a 429 aborted a
    /// flush partway through. Cache data for these keys was already rolled
    /// back by the sender; only the bookkeeping needs to be restored.
    pub fn requeue_finished_keys(&mut self, mut keys: Vec<BeaconKey>) {
        keys.append(&mut self.finished_keys);
        self.finished_keys = keys;
    }

    /// Next absolute time (ms) at which the watchdog should reconsider this
    /// proxy's current session for a timeout-based split, or `None` if
    /// neither the idle nor the duration trigger is currently enabled (or
    /// the proxy has already ended).
    pub fn next_split_deadline_ms(&self) -> Option<i64> {
        if self.ended {
            return None;
        }
        let cfg = self.current.server_config();
        let idle_at = cfg
            .is_session_idle_split_enabled()
            .then(|| self.current.last_interaction_ms() + cfg.session_timeout_ms as i64);
        let duration_at = cfg
            .is_session_duration_split_enabled()
            .then(|| self.current.created_at_ms() + cfg.max_session_duration_ms as i64);
        match (idle_at, duration_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn apply_server_config(&mut self, config: ServerConfig) {
        self.current.apply_server_config(config);
    }

    pub fn enter_action(&mut self, name: &str, start_ms: i64, duration_ms: i64) {
        if self.ended {
            return;
        }
        let count = self.current.enter_action(name, start_ms, duration_ms);
        if self.current.server_config().is_event_count_split_enabled()
            && count >= self.current.server_config().max_events_per_session
        {
            self.split();
        }
    }

    pub fn report_value(&mut self, name: &str, value: &str) {
        if !self.ended {
            self.current.report_value(name, value);
        }
    }

    pub fn report_event(&mut self, name: &str) {
        if !self.ended {
            self.current.report_event(name);
        }
    }

    pub fn report_error(&mut self, name: &str, code: i32, reason: &str) {
        if !self.ended {
            self.current.report_error(name, code, reason);
        }
    }

    pub fn trace_web_request(&mut self, url: &str, response_code: Option<i32>, start_ms: i64, duration_ms: i64) {
        if !self.ended {
            self.current.trace_web_request(url, response_code, start_ms, duration_ms);
        }
    }

    /// Crash reporting always ends the current session and opens a fresh one
    /// in the chain, so later instrumentation calls are not silently
    /// dropped. The crashed session's key is queued in the finished-key
    /// chain for the sender to flush on its next tick.
    pub fn report_crash(&mut self, name: &str, reason: &str, stacktrace: &str) {
        if self.ended {
            return;
        }
        self.current.report_crash(name, reason, stacktrace);
        self.split();
    }

    pub fn identify_user(&mut self, tag: &str) {
        if self.ended {
            return;
        }
        self.user_tag = Some(tag.to_string());
        self.current.identify_user(tag);
    }

    pub fn end(&mut self) {
        if self.ended {
            return;
        }
        self.current.finish();
        self.ended = true;
    }

    /// Whether the watchdog should split this proxy's current session on
    /// either the idle-timeout or the max-duration trigger.
    pub fn due_for_time_split(&self, now_ms: i64) -> bool {
        if self.ended {
            return false;
        }
        let cfg = self.current.server_config();
        let idle_due = cfg.is_session_idle_split_enabled()
            && now_ms - self.current.last_interaction_ms() >= cfg.session_timeout_ms as i64;
        let duration_due = cfg.is_session_duration_split_enabled()
            && now_ms - self.current.created_at_ms() >= cfg.max_session_duration_ms as i64;
        idle_due || duration_due
    }

    /// Split if `due_for_time_split` holds. Called by the watchdog, not by
    /// instrumentation paths.
    pub fn split_if_due(&mut self, now_ms: i64) -> bool {
        if self.due_for_time_split(now_ms) {
            self.split();
            true
        } else {
            false
        }
    }

    /// Finish the current underlying session and open the next one in the
    /// chain, re-applying the last known user tag and carrying forward the
    /// server config the previous session had settled on.
    fn split(&mut self) {
        self.current.finish();
        self.finished_keys.push(self.current.key());
        let carried_config = self.current.server_config().clone();
        let mut next = self.creator.create_session(carried_config);
        if let Some(tag) = &self.user_tag {
            next.identify_user(tag);
        }
        self.current = next;
    }
}
