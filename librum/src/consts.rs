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

use std::time::Duration;

/// Default interval between evictor passes.
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval the watchdog sleeps when neither queue has a deadline.
pub const WATCHDOG_DEFAULT_SLEEP: Duration = Duration::from_secs(5);

/// Join timeout budgets enforced by the facade on shutdown.
pub const WATCHDOG_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
pub const SENDER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Initial-state status request retry policy.
pub const INITIAL_STATUS_RETRIES: u32 = 5;
pub const INITIAL_STATUS_BACKOFF: Duration = Duration::from_secs(1);

/// CaptureOff-state status request retry policy (same shape as Initial).
pub const CAPTURE_OFF_STATUS_RETRIES: u32 = 5;
pub const CAPTURE_OFF_STATUS_BACKOFF: Duration = Duration::from_secs(1);

/// Bounded backoff sequence used by Initial on repeated non-429 failures.
pub const INITIAL_FAILURE_BACKOFF_SEQUENCE: &[Duration] = &[
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(2 * 60 * 60),
];

/// Default period between CaptureOff status re-checks absent an explicit
/// Retry-After override.
pub const DEFAULT_STATUS_CHECK_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

/// Fallback delay applied when a Retry-After header is missing or fails to
/// parse as a bare integer-seconds value.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10 * 60);
