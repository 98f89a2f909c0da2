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

//! Sender states as a tagged enum dispatched through a table of handler
//! functions, matching the cache evictor's preference for plain functions
//! over trait objects: there is exactly one sender thread, so nothing here
//! needs dynamic dispatch.

use std::time::Duration;

use rum_protocol::{parse_status_response, BeaconKey, BeaconRequest, HttpResponse, ServerConfig, StatusRequest};
use tracing::{info, warn};

use crate::{consts, sync::ShutdownSignal, watchdog::ProxyHandle};

use super::SenderContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderStateKind {
    Initial,
    CaptureOn,
    CaptureOff(Option<i64>),
    FlushSessions,
    Terminal,
}

impl SenderStateKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SenderStateKind::Terminal)
    }

    /// Pure match, never a second dispatch slot: what state shutdown should
    /// force us into, from wherever we currently are.
    pub fn shutdown_state(&self) -> SenderStateKind {
        match self {
            SenderStateKind::Initial => SenderStateKind::Terminal,
            SenderStateKind::CaptureOn | SenderStateKind::CaptureOff(_) => SenderStateKind::FlushSessions,
            SenderStateKind::FlushSessions => SenderStateKind::Terminal,
            SenderStateKind::Terminal => SenderStateKind::Terminal,
        }
    }
}

/// Run `current`'s handler once, returning the next state. `Terminal` has an
/// empty handler and simply returns itself.
pub fn dispatch(current: &SenderStateKind, ctx: &SenderContext, shutdown: &ShutdownSignal) -> SenderStateKind {
    match *current {
        SenderStateKind::Initial => execute_initial(ctx, shutdown),
        SenderStateKind::CaptureOn => execute_capture_on(ctx, shutdown),
        SenderStateKind::CaptureOff(sleep_ms) => execute_capture_off(ctx, shutdown, sleep_ms),
        SenderStateKind::FlushSessions => execute_flush_sessions(ctx, shutdown),
        SenderStateKind::Terminal => SenderStateKind::Terminal,
    }
}

fn status_request(ctx: &SenderContext, is_new_session: bool) -> StatusRequest {
    StatusRequest {
        server_id: ctx.server_config.lock().unwrap().server_id,
        app_id: ctx.config.app_id.clone(),
        app_version: ctx.config.app_version.clone(),
        is_new_session,
    }
}

/// The `send_status_request` contract: loop up to `num_retries` times or
/// until shutdown, returning as soon as we get a success or a 429. Anything
/// else sleeps `backoff`, doubles it, and retries.
fn send_status_with_retry(
    ctx: &SenderContext,
    shutdown: &ShutdownSignal,
    is_new_session: bool,
    num_retries: u32,
    initial_backoff: Duration,
) -> Option<HttpResponse> {
    let mut backoff = initial_backoff;
    for _ in 0..num_retries.max(1) {
        if shutdown.is_requested() {
            return None;
        }
        let req = status_request(ctx, is_new_session);
        let result = if is_new_session { ctx.http.send_new_session_request(&req) } else { ctx.http.send_status_request(&req) };
        match result {
            Ok(resp) if resp.is_success() || resp.is_too_many_requests() => return Some(resp),
            Ok(resp) => warn!(status = resp.status, "status request failed, will retry"),
            Err(e) => warn!(error = %e, "status request transport error, will retry"),
        }
        if shutdown.sleep(backoff) {
            return None;
        }
        backoff *= 2;
    }
    None
}

fn execute_initial(ctx: &SenderContext, shutdown: &ShutdownSignal) -> SenderStateKind {
    let mut failure_idx = 0usize;
    loop {
        if shutdown.is_requested() {
            return SenderStateKind::Terminal;
        }
        match send_status_with_retry(ctx, shutdown, false, consts::INITIAL_STATUS_RETRIES, consts::INITIAL_STATUS_BACKOFF) {
            Some(resp) if resp.is_too_many_requests() => {
                ctx.server_config.lock().unwrap().capture = false;
                if shutdown.sleep(Duration::from_secs(resp.retry_after_seconds())) {
                    return SenderStateKind::Terminal;
                }
            }
            Some(resp) if resp.is_success() => {
                let base = *ctx.server_config.lock().unwrap();
                let parsed = parse_status_response(&resp.body_str(), &base);
                *ctx.server_config.lock().unwrap() = parsed;
                ctx.mark_init_complete();
                info!(capture = parsed.capture, "initial status handshake complete");
                return if parsed.capture { SenderStateKind::CaptureOn } else { SenderStateKind::CaptureOff(None) };
            }
            _ => {
                let idx = failure_idx.min(consts::INITIAL_FAILURE_BACKOFF_SEQUENCE.len() - 1);
                let backoff = consts::INITIAL_FAILURE_BACKOFF_SEQUENCE[idx];
                failure_idx += 1;
                if shutdown.sleep(backoff) {
                    return SenderStateKind::Terminal;
                }
            }
        }
    }
}

enum FlushOutcome {
    Ok,
    TooManyRequests(u64),
    Failed,
}

fn flush_session(ctx: &SenderContext, key: &BeaconKey) -> FlushOutcome {
    if ctx.cache.prepare_chunk_snapshot(key).is_none() {
        return FlushOutcome::Ok;
    }
    let max_beacon_size = ctx.server_config.lock().unwrap().max_beacon_size.max(1) as usize;
    loop {
        let chunk = ctx.cache.next_chunk(key, "", max_beacon_size, "&");
        if chunk.is_empty() {
            return FlushOutcome::Ok;
        }
        let req = BeaconRequest { server_id: ctx.server_config.lock().unwrap().server_id, client_ip: None, body: chunk.into_bytes() };
        match ctx.http.send_beacon_request(&req) {
            Ok(resp) if resp.is_success() => ctx.cache.commit_chunk(key),
            Ok(resp) if resp.is_too_many_requests() => {
                let retry_after = resp.retry_after_seconds();
                ctx.cache.rollback_chunk(key);
                return FlushOutcome::TooManyRequests(retry_after);
            }
            _ => {
                ctx.cache.rollback_chunk(key);
                return FlushOutcome::Failed;
            }
        }
    }
}

fn execute_capture_on(ctx: &SenderContext, shutdown: &ShutdownSignal) -> SenderStateKind {
    let interval_ms = ctx.server_config.lock().unwrap().send_interval_ms.max(1) as u64;
    if shutdown.sleep(Duration::from_millis(interval_ms)) {
        return SenderStateKind::FlushSessions;
    }

    let unconfigured: Vec<ProxyHandle> = {
        let sessions = ctx.sessions.lock().unwrap();
        sessions.iter().filter(|(_, t)| !t.ever_configured).map(|(h, _)| *h).collect()
    };
    if !unconfigured.is_empty() {
        match send_status_with_retry(ctx, shutdown, true, 1, consts::INITIAL_STATUS_BACKOFF) {
            Some(resp) if resp.is_too_many_requests() => {
                return SenderStateKind::CaptureOff(Some(resp.retry_after_seconds() as i64 * 1000));
            }
            Some(resp) if resp.is_success() => {
                let base = *ctx.server_config.lock().unwrap();
                let parsed = parse_status_response(&resp.body_str(), &base);
                *ctx.server_config.lock().unwrap() = parsed;
                if !parsed.capture {
                    return SenderStateKind::CaptureOff(None);
                }
                let mut sessions = ctx.sessions.lock().unwrap();
                for handle in &unconfigured {
                    if let Some(tracked) = sessions.get_mut(handle) {
                        tracked.proxy.lock().unwrap().apply_server_config(parsed);
                        tracked.ever_configured = true;
                    }
                }
            }
            _ => {}
        }
    }

    // Each tracked proxy may own a whole chain of sessions by now (one key
    // per split). Drain and flush every finished tail key before deciding
    // whether the proxy's current (tail) session is itself done or open.
    let handles: Vec<ProxyHandle> = ctx.sessions.lock().unwrap().keys().copied().collect();
    for handle in &handles {
        let configured = ctx.sessions.lock().unwrap().get(handle).map(|t| t.ever_configured).unwrap_or(false);
        if !configured {
            continue;
        }

        let finished_keys: Vec<BeaconKey> = {
            let sessions = ctx.sessions.lock().unwrap();
            match sessions.get(handle) {
                Some(t) => t.proxy.lock().unwrap().drain_finished_keys(),
                None => continue,
            }
        };
        for (i, key) in finished_keys.iter().enumerate() {
            match flush_session(ctx, key) {
                FlushOutcome::Ok | FlushOutcome::Failed => ctx.cache.delete_cache_entry(key),
                FlushOutcome::TooManyRequests(retry_after) => {
                    let sessions = ctx.sessions.lock().unwrap();
                    if let Some(t) = sessions.get(handle) {
                        t.proxy.lock().unwrap().requeue_finished_keys(finished_keys[i..].to_vec());
                    }
                    return SenderStateKind::CaptureOff(Some(retry_after as i64 * 1000));
                }
            }
        }

        let (ended, current_key) = {
            let sessions = ctx.sessions.lock().unwrap();
            let Some(t) = sessions.get(handle) else { continue };
            let p = t.proxy.lock().unwrap();
            (p.is_ended(), p.current_key())
        };
        if ended {
            if let FlushOutcome::TooManyRequests(retry_after) = flush_session(ctx, &current_key) {
                return SenderStateKind::CaptureOff(Some(retry_after as i64 * 1000));
            }
            ctx.cache.delete_cache_entry(&current_key);
            ctx.unregister_session(*handle);
        }
    }

    let now = ctx.clock.now_ms();
    let due = now - *ctx.last_open_send_time_ms.lock().unwrap() > interval_ms as i64;
    if due {
        let open_keys: Vec<BeaconKey> = {
            let sessions = ctx.sessions.lock().unwrap();
            sessions
                .values()
                .filter(|t| t.ever_configured)
                .filter_map(|t| {
                    let p = t.proxy.lock().unwrap();
                    (!p.is_ended()).then(|| p.current_key())
                })
                .collect()
        };
        for key in &open_keys {
            if let FlushOutcome::TooManyRequests(retry_after) = flush_session(ctx, key) {
                return SenderStateKind::CaptureOff(Some(retry_after as i64 * 1000));
            }
        }
        *ctx.last_open_send_time_ms.lock().unwrap() = now;
    }

    if !ctx.server_config.lock().unwrap().capture {
        return SenderStateKind::CaptureOff(None);
    }
    SenderStateKind::CaptureOn
}

fn execute_capture_off(ctx: &SenderContext, shutdown: &ShutdownSignal, sleep_override: Option<i64>) -> SenderStateKind {
    ctx.server_config.lock().unwrap().capture = false;
    let handles: Vec<ProxyHandle> = ctx.sessions.lock().unwrap().keys().copied().collect();
    for handle in &handles {
        let sessions = ctx.sessions.lock().unwrap();
        if let Some(tracked) = sessions.get(handle) {
            let mut proxy = tracked.proxy.lock().unwrap();
            for key in proxy.drain_finished_keys() {
                ctx.cache.delete_cache_entry(&key);
            }
            ctx.cache.delete_cache_entry(&proxy.current_key());
        }
    }

    let sleep_dur = match sleep_override {
        Some(ms) => Duration::from_millis(ms.max(0) as u64),
        None => {
            let now = ctx.clock.now_ms();
            let elapsed = now - *ctx.last_status_check_ms.lock().unwrap();
            let remaining = consts::DEFAULT_STATUS_CHECK_INTERVAL.as_millis() as i64 - elapsed;
            Duration::from_millis(remaining.max(0) as u64)
        }
    };
    if shutdown.sleep(sleep_dur) {
        return SenderStateKind::FlushSessions;
    }

    *ctx.last_status_check_ms.lock().unwrap() = ctx.clock.now_ms();
    match send_status_with_retry(ctx, shutdown, false, consts::CAPTURE_OFF_STATUS_RETRIES, consts::CAPTURE_OFF_STATUS_BACKOFF) {
        Some(resp) if resp.is_too_many_requests() => SenderStateKind::CaptureOff(Some(resp.retry_after_seconds() as i64 * 1000)),
        Some(resp) if resp.is_success() => {
            let base = *ctx.server_config.lock().unwrap();
            let parsed = parse_status_response(&resp.body_str(), &base);
            *ctx.server_config.lock().unwrap() = parsed;
            if parsed.capture {
                SenderStateKind::CaptureOn
            } else {
                SenderStateKind::CaptureOff(None)
            }
        }
        _ => SenderStateKind::CaptureOff(None),
    }
}

fn execute_flush_sessions(ctx: &SenderContext, _shutdown: &ShutdownSignal) -> SenderStateKind {
    let handles: Vec<ProxyHandle> = ctx.sessions.lock().unwrap().keys().copied().collect();

    for handle in &handles {
        let sessions = ctx.sessions.lock().unwrap();
        if let Some(tracked) = sessions.get(handle) {
            let mut proxy = tracked.proxy.lock().unwrap();
            if !tracked.ever_configured {
                proxy.apply_server_config(ServerConfig::flush_fallback());
            }
            proxy.end();
        }
    }

    'handles: for handle in &handles {
        let keys: Vec<BeaconKey> = {
            let sessions = ctx.sessions.lock().unwrap();
            let Some(tracked) = sessions.get(handle) else { continue };
            let mut proxy = tracked.proxy.lock().unwrap();
            let mut keys = proxy.drain_finished_keys();
            keys.push(proxy.current_key());
            keys
        };
        for key in &keys {
            match flush_session(ctx, key) {
                FlushOutcome::TooManyRequests(_) => break 'handles,
                _ => ctx.cache.delete_cache_entry(key),
            }
        }
    }
    ctx.sessions.lock().unwrap().clear();
    SenderStateKind::Terminal
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex as StdMutex};

    use rum_protocol::HttpClient;

    use super::*;
    use crate::{cache::BeaconCache, providers::TestClock, session::proxy::SessionProxy, sender::SenderConfig};

    struct ScriptedHttp {
        status_responses: StdMutex<Vec<HttpResponse>>,
        beacon_responses: StdMutex<Vec<HttpResponse>>,
    }

    fn ok(body: &str) -> HttpResponse {
        HttpResponse { status: 200, headers: Default::default(), body: body.as_bytes().to_vec() }
    }

    impl HttpClient for ScriptedHttp {
        fn send_status_request(&self, _req: &StatusRequest) -> anyhow::Result<HttpResponse> {
            Ok(self.status_responses.lock().unwrap().remove(0))
        }
        fn send_new_session_request(&self, _req: &StatusRequest) -> anyhow::Result<HttpResponse> {
            Ok(self.status_responses.lock().unwrap().remove(0))
        }
        fn send_beacon_request(&self, _req: &BeaconRequest) -> anyhow::Result<HttpResponse> {
            Ok(self.beacon_responses.lock().unwrap().remove(0))
        }
    }

    fn new_ctx(http: ScriptedHttp) -> SenderContext {
        SenderContext::new(
            Arc::new(BeaconCache::new()),
            Arc::new(TestClock::new(0)),
            Arc::new(http),
            SenderConfig { app_id: "app".into(), app_version: "1.0".into(), default_server_config: ServerConfig::default() },
        )
    }

    #[test]
    fn initial_success_transitions_to_capture_on() {
        let http = ScriptedHttp { status_responses: StdMutex::new(vec![ok("cp=1")]), beacon_responses: StdMutex::new(vec![]) };
        let ctx = new_ctx(http);
        let shutdown = ShutdownSignal::new();
        let next = execute_initial(&ctx, &shutdown);
        assert_eq!(next, SenderStateKind::CaptureOn);
        assert!(ctx.wait_for_init(Duration::from_millis(10)));
    }

    #[test]
    fn initial_capture_off_response_transitions_to_capture_off() {
        let http = ScriptedHttp { status_responses: StdMutex::new(vec![ok("cp=0")]), beacon_responses: StdMutex::new(vec![]) };
        let ctx = new_ctx(http);
        let shutdown = ShutdownSignal::new();
        let next = execute_initial(&ctx, &shutdown);
        assert_eq!(next, SenderStateKind::CaptureOff(None));
    }

    #[test]
    fn shutdown_state_maps_active_states_to_flush_sessions() {
        assert_eq!(SenderStateKind::CaptureOn.shutdown_state(), SenderStateKind::FlushSessions);
        assert_eq!(SenderStateKind::CaptureOff(None).shutdown_state(), SenderStateKind::FlushSessions);
        assert_eq!(SenderStateKind::FlushSessions.shutdown_state(), SenderStateKind::Terminal);
        assert_eq!(SenderStateKind::Initial.shutdown_state(), SenderStateKind::Terminal);
    }

    #[test]
    fn flush_sessions_drains_and_reaches_terminal() {
        let http = ScriptedHttp { status_responses: StdMutex::new(vec![]), beacon_responses: StdMutex::new(vec![ok("")]) };
        let ctx = new_ctx(http);
        let shutdown = ShutdownSignal::new();

        let cache = ctx.cache.clone();
        let clock: Arc<dyn crate::providers::Clock> = Arc::new(TestClock::new(0));
        struct FixedPrng;
        impl crate::providers::Prng for FixedPrng {
            fn next_u32(&self) -> u32 {
                1
            }
        }
        let proxy = Arc::new(StdMutex::new(SessionProxy::new(&FixedPrng, cache.clone(), clock, ServerConfig::default())));
        let key = proxy.lock().unwrap().current_key();
        cache.add_event(key, 0, "e1".to_string());
        ctx.register_session(1, proxy);

        let next = execute_flush_sessions(&ctx, &shutdown);
        assert_eq!(next, SenderStateKind::Terminal);
        assert!(ctx.sessions.lock().unwrap().is_empty());
    }

    #[test]
    fn capture_on_flushes_every_key_in_a_split_chain() {
        // S3: an event-count split leaves one proxy owning two keys. Both
        // must go out, not just the one the sender saw at registration.
        let http = ScriptedHttp {
            status_responses: StdMutex::new(vec![]),
            beacon_responses: StdMutex::new(vec![ok(""), ok("")]),
        };
        let ctx = new_ctx(http);
        let shutdown = ShutdownSignal::new();

        let cache = ctx.cache.clone();
        let clock: Arc<dyn crate::providers::Clock> = Arc::new(TestClock::new(0));
        struct FixedPrng;
        impl crate::providers::Prng for FixedPrng {
            fn next_u32(&self) -> u32 {
                1
            }
        }
        let mut proxy = SessionProxy::new(&FixedPrng, cache.clone(), clock, ServerConfig::default());
        let mut cfg = ServerConfig::default();
        cfg.session_split_by_events_enabled = true;
        cfg.max_events_per_session = 1;
        proxy.apply_server_config(cfg);

        let first_key = proxy.current_key();
        proxy.enter_action("a", 0, 1); // triggers a split: first_key now finished
        let second_key = proxy.current_key();
        assert_ne!(first_key, second_key);
        cache.add_event(second_key, 1, "e2".to_string());

        ctx.register_session(1, Arc::new(StdMutex::new(proxy)));
        if let Some(t) = ctx.sessions.lock().unwrap().get_mut(&1) {
            t.ever_configured = true;
        }
        ctx.server_config.lock().unwrap().send_interval_ms = 1;
        *ctx.last_open_send_time_ms.lock().unwrap() = -1_000_000; // force the open-session flush too

        execute_capture_on(&ctx, &shutdown);

        assert!(cache.is_empty(&first_key));
        assert!(cache.is_empty(&second_key));
    }
}
