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

//! Mints fresh `Session`s sharing one `beacon_id`, handing out increasing
//! `sequence_number`s. One `SessionCreator` is owned per `SessionProxy`.

use std::sync::Arc;

use rum_protocol::{BeaconKey, ServerConfig};

use crate::{cache::BeaconCache, providers::{Clock, Prng}, session::Session};

pub struct SessionCreator {
    beacon_id: i32,
    next_sequence_number: i32,
    cache: Arc<BeaconCache>,
    clock: Arc<dyn Clock>,
}

impl SessionCreator {
    pub fn new(prng: &dyn Prng, cache: Arc<BeaconCache>, clock: Arc<dyn Clock>) -> Self {
        SessionCreator { beacon_id: prng.next_u32() as i32, next_sequence_number: 0, cache, clock }
    }

    pub fn beacon_id(&self) -> i32 {
        self.beacon_id
    }

    /// Build the next `Session` in this creator's chain, consuming the next
    /// sequence number. The returned session starts unconfigured; the
    /// caller decides whether to carry over the previous session's server
    /// config immediately or wait for a fresh status response.
    pub fn create_session(&mut self, default_config: ServerConfig) -> Session {
        let key = BeaconKey::new(self.beacon_id, self.next_sequence_number);
        self.next_sequence_number += 1;
        Session::new(key, self.cache.clone(), self.clock.clone(), default_config)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::providers::TestClock;

    struct FixedPrng(u32);
    impl Prng for FixedPrng {
        fn next_u32(&self) -> u32 {
            self.0
        }
    }

    #[test]
    fn sequence_numbers_increase_within_one_beacon_id() {
        let cache = Arc::new(BeaconCache::new());
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new(0));
        let prng = FixedPrng(42);
        let mut creator = SessionCreator::new(&prng, cache, clock);

        let s0 = creator.create_session(ServerConfig::default());
        let s1 = creator.create_session(ServerConfig::default());

        assert_eq!(s0.key(), BeaconKey::new(42, 0));
        assert_eq!(s1.key(), BeaconKey::new(42, 1));
    }
}
