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

//! The cache evictor (C4): a background thread applying two strategies
//! against the beacon cache — time-based, then space-based — on a fixed
//! interval. The evictor is the only component allowed to call `evict_*`;
//! instrumentation and the sender never evict.

use std::{sync::Arc, time::Duration};

use tracing::{info, instrument, span, Level};

use crate::{cache::BeaconCache, providers::Clock, sync::ShutdownSignal, test_hooks};

pub struct EvictorConfig {
    pub lower_bound: i64,
    pub upper_bound: i64,
    pub max_record_age_ms: i64,
    pub interval: Duration,
}

/// Run the evictor loop. Intended to be invoked in a dedicated thread; the
/// caller is responsible for spawning it and joining on `shutdown`.
#[instrument(skip_all)]
pub fn run(
    cache: Arc<BeaconCache>,
    clock: Arc<dyn Clock>,
    config: EvictorConfig,
    shutdown: Arc<ShutdownSignal>,
) {
    let _s = span!(Level::INFO, "evictor").entered();
    loop {
        run_pass(&cache, clock.as_ref(), &config, &shutdown);
        test_hooks::emit("evictor:pass");
        if shutdown.sleep(config.interval) {
            info!("evictor exiting on shutdown");
            return;
        }
    }
}

fn run_pass(cache: &BeaconCache, clock: &dyn Clock, config: &EvictorConfig, shutdown: &ShutdownSignal) {
    run_time_based(cache, clock, config);
    run_space_based(cache, config, shutdown);
}

fn run_time_based(cache: &BeaconCache, clock: &dyn Clock, config: &EvictorConfig) {
    if config.max_record_age_ms <= 0 {
        return;
    }
    let min_timestamp = clock.now_ms() - config.max_record_age_ms;
    for key in cache.get_beacon_keys() {
        let removed = cache.evict_by_age(&key, min_timestamp);
        if removed > 0 {
            info!(?key, removed, "evicted aged-out records");
        }
    }
}

fn run_space_based(cache: &BeaconCache, config: &EvictorConfig, shutdown: &ShutdownSignal) {
    if is_disabled(config) {
        return;
    }

    while cache.num_bytes_in_cache() > config.upper_bound {
        if shutdown.is_requested() {
            return;
        }
        let mut progressed = false;
        for key in cache.get_beacon_keys() {
            if cache.num_bytes_in_cache() <= config.lower_bound {
                return;
            }
            let removed = cache.evict_by_number(&key, 1);
            progressed = progressed || removed > 0;
        }
        if !progressed {
            // every key is either empty or fully in-flight; nothing left we
            // are allowed to touch this pass.
            return;
        }
    }
}

fn is_disabled(config: &EvictorConfig) -> bool {
    config.lower_bound <= 0 || config.upper_bound <= 0 || config.upper_bound < config.lower_bound
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{cache::BeaconKey, providers::TestClock};

    #[test]
    fn s4_eviction_by_size() {
        let cache = Arc::new(BeaconCache::new());
        let key = BeaconKey::new(1, 0);
        for i in 0..10 {
            cache.add_event(key, i, "x".repeat(15));
        }
        assert_eq!(cache.num_bytes_in_cache(), 150);

        let config = EvictorConfig { lower_bound: 50, upper_bound: 100, max_record_age_ms: 0, interval: Duration::from_secs(1) };
        let shutdown = ShutdownSignal::new();
        run_space_based(&cache, &config, &shutdown);

        assert!(cache.num_bytes_in_cache() <= 50);
    }

    #[test]
    fn disabled_when_bounds_are_zero() {
        let cache = Arc::new(BeaconCache::new());
        let key = BeaconKey::new(1, 0);
        cache.add_event(key, 0, "x".repeat(1000));

        let config = EvictorConfig { lower_bound: 0, upper_bound: 0, max_record_age_ms: 0, interval: Duration::from_secs(1) };
        let shutdown = ShutdownSignal::new();
        run_space_based(&cache, &config, &shutdown);

        assert_eq!(cache.num_bytes_in_cache(), 1000);
    }

    #[test]
    fn time_based_eviction_drops_aged_records() {
        let cache = Arc::new(BeaconCache::new());
        let key = BeaconKey::new(1, 0);
        cache.add_event(key, 0, "old".to_string());
        cache.add_event(key, 10_000, "new".to_string());

        let clock = TestClock::new(10_000);
        let config = EvictorConfig { lower_bound: 0, upper_bound: 0, max_record_age_ms: 5_000, interval: Duration::from_secs(1) };
        run_time_based(&cache, &clock, &config);

        assert_eq!(cache.num_bytes_in_cache(), 3); // only "new" remains
    }
}
