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

//! The beacon payload encoder (C2): given an in-memory action/event
//! description, produce the UTF-8 fragment that gets appended to a
//! transmission chunk. Payload semantics beyond size accounting are out of
//! scope for the core, so this just joins pre-escaped key=value pairs the
//! way the wire format expects.

/// Encode a named event with an ordered list of already-escaped key/value
/// pairs into one record fragment, e.g. `et=action&na=checkout&t0=1000`.
pub fn encode_action(event_type: &str, name: &str, start_ms: i64, duration_ms: i64) -> String {
    format!("et={}&na={}&t0={}&t1={}", event_type, escape(name), start_ms, start_ms + duration_ms)
}

pub fn encode_value(name: &str, value: &str, timestamp_ms: i64) -> String {
    format!("et=value&na={}&vl={}&t0={}", escape(name), escape(value), timestamp_ms)
}

pub fn encode_event(name: &str, timestamp_ms: i64) -> String {
    format!("et=event&na={}&t0={}", escape(name), timestamp_ms)
}

pub fn encode_error(name: &str, code: i32, reason: &str, timestamp_ms: i64) -> String {
    format!("et=error&na={}&ec={}&rs={}&t0={}", escape(name), code, escape(reason), timestamp_ms)
}

pub fn encode_crash(name: &str, reason: &str, stacktrace: &str, timestamp_ms: i64) -> String {
    format!(
        "et=crash&na={}&rs={}&st={}&t0={}",
        escape(name),
        escape(reason),
        escape(stacktrace),
        timestamp_ms
    )
}

pub fn encode_web_request(url: &str, response_code: Option<i32>, start_ms: i64, duration_ms: i64) -> String {
    let rc = response_code.map(|c| c.to_string()).unwrap_or_default();
    format!("et=web_request&url={}&rc={}&t0={}&t1={}", escape(url), rc, start_ms, start_ms + duration_ms)
}

pub fn encode_identify_user(tag: &str, timestamp_ms: i64) -> String {
    format!("et=identify_user&na={}&t0={}", escape(tag), timestamp_ms)
}

/// Escape `&`, `=`, and newlines so a free-form value can't be mistaken for
/// a field delimiter by the chunk assembler or the backend's query parser.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            '\n' => out.push_str("%0A"),
            '%' => out.push_str("%25"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_action_has_expected_shape() {
        let s = encode_action("action", "checkout", 100, 50);
        assert_eq!(s, "et=action&na=checkout&t0=100&t1=150");
    }

    #[test]
    fn escape_neutralizes_delimiters() {
        let s = encode_event("a&b=c\n", 0);
        assert_eq!(s, "et=event&na=a%26b%3Dc%0A&t0=0");
    }

    #[test]
    fn web_request_without_response_code() {
        let s = encode_web_request("https://example.com", None, 10, 5);
        assert_eq!(s, "et=web_request&url=https://example.com&rc=&t0=10&t1=15");
    }
}
