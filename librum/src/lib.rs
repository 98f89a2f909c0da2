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

//! A Real User Monitoring agent core: a beacon cache, a sender state
//! machine, a session watchdog, and a thin facade over the three, meant to
//! be embedded in a host application the way the original distributed
//! source's OpenKit core is embedded in native/mobile clients.
//!
//! This crate owns the embedded runtime only. It has no knowledge of the
//! instrumentation surface's exact API shape beyond what `SessionProxy`
//! exposes; no knowledge of the wire format beyond what `rum_protocol`
//! defines; and no opinion on which `HttpClient` a host app should use
//! beyond the `ureq`-backed default in [`http`].

pub mod beacon;
pub mod cache;
pub mod config;
pub mod consts;
pub mod facade;
pub mod http;
pub mod providers;
pub mod sender;
pub mod session;
pub mod sync;
pub mod test_hooks;
pub mod watchdog;

pub use config::Config;
pub use facade::{Facade, FacadeConfig, SessionHandle};
pub use providers::Providers;

use std::io;

use tracing_subscriber::fmt::format::FmtSpan;

/// Install a `tracing-subscriber` formatter writing to stderr. Mirrors the
/// teacher's daemon logging setup (thread ids, span enter/exit events, no
/// target module path) but without file-logging support, since this core
/// has no daemon mode of its own to redirect.
pub fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(io::stderr)
        .try_init();
}

/// Build a `Facade` from a loaded `Config` and an injectable `HttpClient`,
/// wiring the default system providers (real clock, real PRNG, counting
/// thread ids). Callers needing deterministic providers for tests should
/// construct `Facade::new` directly.
pub fn build_facade(config: &Config, http_client: std::sync::Arc<dyn rum_protocol::HttpClient>) -> Facade {
    let providers = Providers {
        clock: std::sync::Arc::new(providers::SystemClock::new()),
        prng: std::sync::Arc::new(providers::SystemPrng),
        thread_id: std::sync::Arc::new(providers::CountingThreadId::new()),
        http_client,
    };
    let facade_config = FacadeConfig {
        app_id: config.application_id.clone(),
        app_version: config.application_version.clone(),
        endpoint_default_config: config.default_server_config,
        eviction_lower_bound: config.cache_lower_bound,
        eviction_upper_bound: config.cache_upper_bound,
        max_record_age_ms: config.max_record_age_ms,
        eviction_interval: std::time::Duration::from_millis(config.eviction_interval_ms.max(0) as u64),
    };
    Facade::new(providers, facade_config)
}
