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

//! Pure capability interfaces injected into every other component: a time
//! source, a PRNG, a thread-id provider, and the HTTP client. Keeping these
//! behind traits is what lets the sender/watchdog/cache tests run
//! deterministically instead of against real wall-clock time and sockets.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use rand::RngCore;
use rum_protocol::HttpClient;

/// Monotonic-ish clock, milliseconds since an arbitrary epoch. Records'
/// `timestamp` fields are opaque and only need to be totally ordered within
/// a session, so a test clock can use a simple counter.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Source of randomness for session ids and the like.
pub trait Prng: Send + Sync {
    fn next_u32(&self) -> u32;
}

/// Identifies the calling thread, used only for log attribution.
pub trait ThreadId: Send + Sync {
    fn current(&self) -> u64;
}

/// The full provider bundle threaded through the facade into every
/// component that needs one of these capabilities.
#[derive(Clone)]
pub struct Providers {
    pub clock: Arc<dyn Clock>,
    pub prng: Arc<dyn Prng>,
    pub thread_id: Arc<dyn ThreadId>,
    pub http_client: Arc<dyn HttpClient>,
}

/// Real-clock implementation backed by `std::time`.
pub struct SystemClock {
    epoch: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock { epoch: std::time::Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }
}

/// `rand`-backed PRNG.
pub struct SystemPrng;

impl Prng for SystemPrng {
    fn next_u32(&self) -> u32 {
        rand::thread_rng().next_u32()
    }
}

/// Thread-id provider using a process-local monotonically increasing
/// counter rather than the OS thread id, so it is stable across platforms.
pub struct CountingThreadId {
    next: AtomicI64,
}

impl CountingThreadId {
    pub fn new() -> Self {
        CountingThreadId { next: AtomicI64::new(0) }
    }
}

impl Default for CountingThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadId for CountingThreadId {
    fn current(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) as u64
    }
}

/// A test clock advanced explicitly by the test, rather than tracking wall
/// time, so timing-sensitive assertions (split windows, backoff sequences)
/// are deterministic.
pub struct TestClock {
    millis: AtomicI64,
}

impl TestClock {
    pub fn new(start_ms: i64) -> Self {
        TestClock { millis: AtomicI64::new(start_ms) }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.millis.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_clock_advances_explicitly() {
        let clock = TestClock::new(100);
        assert_eq!(clock.now_ms(), 100);
        clock.advance(50);
        assert_eq!(clock.now_ms(), 150);
    }

    #[test]
    fn counting_thread_id_is_monotone() {
        let ids = CountingThreadId::new();
        let a = ids.current();
        let b = ids.current();
        assert!(b > a);
    }
}
