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

//! Wire types and the status-response grammar shared between the RUM agent
//! core and whatever `HttpClient` implementation a host application plugs
//! in. This crate has no knowledge of threads, caches, or sessions; it only
//! knows how to build requests and parse responses.

use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

/// Identity of a session's payload bucket. Two sessions split from the same
/// logical session share `beacon_id` but differ in `sequence_number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BeaconKey {
    pub beacon_id: i32,
    pub sequence_number: i32,
}

impl BeaconKey {
    pub fn new(beacon_id: i32, sequence_number: i32) -> Self {
        BeaconKey { beacon_id, sequence_number }
    }
}

/// Server-directed capture policy, received in status and new-session
/// responses. `visit_store_version` and `session_split_by_events_enabled`
/// are carried from the original distributed source's server-configuration
/// builder; this core does not branch on `visit_store_version` beyond
/// exposing it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub capture: bool,
    pub crash_reporting: bool,
    pub error_reporting: bool,
    pub server_id: i32,
    pub max_beacon_size: i32,
    pub multiplicity: i32,
    pub send_interval_ms: i32,
    pub max_session_duration_ms: i32,
    pub max_events_per_session: i32,
    pub session_split_by_events_enabled: bool,
    pub session_timeout_ms: i32,
    pub visit_store_version: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            capture: true,
            crash_reporting: true,
            error_reporting: true,
            server_id: 1,
            max_beacon_size: 30 * 1024,
            multiplicity: 1,
            send_interval_ms: 120_000,
            max_session_duration_ms: -1,
            max_events_per_session: -1,
            session_split_by_events_enabled: false,
            session_timeout_ms: 600_000,
            visit_store_version: 1,
        }
    }
}

impl ServerConfig {
    /// A minimal config synthesized by `FlushSessions` for sessions that
    /// never received a real server config, so their data can still be
    /// flushed on shutdown.
    pub fn flush_fallback() -> Self {
        ServerConfig { multiplicity: 1, ..ServerConfig::default() }
    }

    pub fn is_session_duration_split_enabled(&self) -> bool {
        self.max_session_duration_ms > 0
    }

    pub fn is_session_idle_split_enabled(&self) -> bool {
        self.session_timeout_ms > 0
    }

    pub fn is_event_count_split_enabled(&self) -> bool {
        self.session_split_by_events_enabled && self.max_events_per_session > 0
    }

    pub fn is_sending_allowed(&self) -> bool {
        self.capture && self.multiplicity != 0
    }

    /// Merge a freshly received config (`other`) over `self`. Capture/crash/
    /// error flags, multiplicity, and the timing knobs (server id, beacon
    /// size, send interval) take `other`'s value outright since they reflect
    /// the backend's current policy. The session-shape knobs are grouped
    /// with `max_session_duration_ms`/`max_events_per_session` in the
    /// original's `ServerConfiguration::merge` and are only overwritten when
    /// `other` actually differs from the default, so a transient
    /// capture-policy update does not silently reset previously learned
    /// session-shape rules.
    pub fn merge(&self, other: &ServerConfig) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            capture: other.capture,
            crash_reporting: other.crash_reporting,
            error_reporting: other.error_reporting,
            server_id: other.server_id,
            max_beacon_size: other.max_beacon_size,
            multiplicity: other.multiplicity,
            send_interval_ms: other.send_interval_ms,
            max_session_duration_ms: if other.max_session_duration_ms != defaults.max_session_duration_ms {
                other.max_session_duration_ms
            } else {
                self.max_session_duration_ms
            },
            max_events_per_session: if other.max_events_per_session != defaults.max_events_per_session {
                other.max_events_per_session
            } else {
                self.max_events_per_session
            },
            session_split_by_events_enabled: if other.session_split_by_events_enabled {
                other.session_split_by_events_enabled
            } else {
                self.session_split_by_events_enabled
            },
            session_timeout_ms: if other.session_timeout_ms != defaults.session_timeout_ms {
                other.session_timeout_ms
            } else {
                self.session_timeout_ms
            },
            visit_store_version: if other.visit_store_version != defaults.visit_store_version {
                other.visit_store_version
            } else {
                self.visit_store_version
            },
        }
    }
}

const RESPONSE_KEY_CAPTURE: &str = "cp";
const RESPONSE_KEY_SEND_INTERVAL: &str = "si";
const RESPONSE_KEY_SERVER_ID: &str = "id";
const RESPONSE_KEY_MAX_BEACON_SIZE: &str = "bl";
const RESPONSE_KEY_CAPTURE_ERRORS: &str = "er";
const RESPONSE_KEY_CAPTURE_CRASHES: &str = "cr";
const RESPONSE_KEY_MULTIPLICITY: &str = "mp";

/// Parse a status/new-session response body (`key=value&key=value...`) into
/// a `ServerConfig`, starting from `base` for any key that is absent or
/// fails to parse. Unknown keys are ignored; malformed values fall back to
/// `base`'s value for that field rather than failing the whole parse,
/// matching the "protocol parse errors are not exceptions" handling rule.
pub fn parse_status_response(body: &str, base: &ServerConfig) -> ServerConfig {
    let mut cfg = *base;
    for part in body.split('&') {
        let Some((key, value)) = part.split_once('=') else { continue };
        if key.is_empty() || value.is_empty() {
            continue;
        }
        match key {
            RESPONSE_KEY_CAPTURE => {
                if let Ok(v) = value.parse::<i32>() {
                    cfg.capture = v == 1;
                }
            }
            RESPONSE_KEY_SEND_INTERVAL => {
                if let Ok(v) = value.parse::<i32>() {
                    cfg.send_interval_ms = v.saturating_mul(1000);
                }
            }
            RESPONSE_KEY_SERVER_ID => {
                if let Ok(v) = value.parse::<i32>() {
                    cfg.server_id = v;
                }
            }
            RESPONSE_KEY_MAX_BEACON_SIZE => {
                if let Ok(v) = value.parse::<i32>() {
                    cfg.max_beacon_size = v;
                }
            }
            RESPONSE_KEY_CAPTURE_ERRORS => {
                if let Ok(v) = value.parse::<i32>() {
                    // 1 (always on) and 2 (only on wifi) are treated the same
                    cfg.error_reporting = v != 0;
                }
            }
            RESPONSE_KEY_CAPTURE_CRASHES => {
                if let Ok(v) = value.parse::<i32>() {
                    cfg.crash_reporting = v != 0;
                }
            }
            RESPONSE_KEY_MULTIPLICITY => {
                if let Ok(v) = value.parse::<i32>() {
                    cfg.multiplicity = v;
                }
            }
            _ => {}
        }
    }
    cfg
}

/// Parse a `Retry-After` header value as a bare integer-seconds count. The
/// HTTP-date form exists in the standard but is not implemented here,
/// matching the preserved behavior of the distilled source.
pub fn parse_retry_after_seconds(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}

/// A status-check or new-session request. Both share the same query-string
/// shape; `is_new_session` toggles the `ns=1` discriminator.
#[derive(Debug, Clone)]
pub struct StatusRequest {
    pub server_id: i32,
    pub app_id: String,
    pub app_version: String,
    pub is_new_session: bool,
}

/// A beacon-send request: a chunk of serialized records posted to the
/// backend on behalf of one session.
#[derive(Debug, Clone)]
pub struct BeaconRequest {
    pub server_id: i32,
    pub client_ip: Option<String>,
    pub body: Vec<u8>,
}

/// Outcome of any of the three request kinds.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_too_many_requests(&self) -> bool {
        self.status == 429
    }

    /// The server-requested retry delay, defaulting to
    /// `DEFAULT_RETRY_AFTER_SECS` when the header is absent or malformed.
    pub fn retry_after_seconds(&self) -> u64 {
        self.headers
            .get("Retry-After")
            .or_else(|| self.headers.get("retry-after"))
            .and_then(|v| parse_retry_after_seconds(v))
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

pub const DEFAULT_RETRY_AFTER_SECS: u64 = 10 * 60;

/// Capability injected into the sender: issues the three HTTP request
/// kinds described by the backend contract. Implementations are free to add
/// TLS, compression, or header assembly; this trait only fixes the shape of
/// the exchange.
pub trait HttpClient: Send + Sync {
    fn send_status_request(&self, req: &StatusRequest) -> anyhow::Result<HttpResponse>;
    fn send_new_session_request(&self, req: &StatusRequest) -> anyhow::Result<HttpResponse>;
    fn send_beacon_request(&self, req: &BeaconRequest) -> anyhow::Result<HttpResponse>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_status_response_applies_known_keys() {
        let base = ServerConfig::default();
        let cfg = parse_status_response("cp=1&si=30&mp=2&bl=1024&er=0&cr=2&id=7", &base);
        assert!(cfg.capture);
        assert_eq!(cfg.send_interval_ms, 30_000);
        assert_eq!(cfg.multiplicity, 2);
        assert_eq!(cfg.max_beacon_size, 1024);
        assert!(!cfg.error_reporting);
        assert!(cfg.crash_reporting);
        assert_eq!(cfg.server_id, 7);
    }

    #[test]
    fn parse_status_response_ignores_unknown_and_malformed() {
        let base = ServerConfig::default();
        let cfg = parse_status_response("bn=myapp&cp=&mp=notanumber", &base);
        assert_eq!(cfg, base);
    }

    #[test]
    fn retry_after_falls_back_on_malformed_header() {
        let mut headers = HashMap::new();
        headers.insert("Retry-After".to_string(), "soon".to_string());
        let resp = HttpResponse { status: 429, headers, body: Vec::new() };
        assert_eq!(resp.retry_after_seconds(), DEFAULT_RETRY_AFTER_SECS);
    }

    #[test]
    fn retry_after_parses_bare_integer() {
        let mut headers = HashMap::new();
        headers.insert("Retry-After".to_string(), "30".to_string());
        let resp = HttpResponse { status: 429, headers, body: Vec::new() };
        assert_eq!(resp.retry_after_seconds(), 30);
    }

    #[test]
    fn merge_retains_session_shape_unless_other_differs() {
        let mut learned = ServerConfig::default();
        learned.max_events_per_session = 50;
        learned.session_split_by_events_enabled = true;

        let mut policy_update = ServerConfig::default();
        policy_update.capture = false;

        let merged = learned.merge(&policy_update);
        assert!(!merged.capture);
        assert_eq!(merged.max_events_per_session, 50);
        assert!(merged.session_split_by_events_enabled);
    }

    #[test]
    fn beacon_key_equality_is_structural() {
        assert_eq!(BeaconKey::new(7, 0), BeaconKey::new(7, 0));
        assert_ne!(BeaconKey::new(7, 0), BeaconKey::new(7, 1));
    }
}
