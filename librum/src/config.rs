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

use std::fs;

use anyhow::Context;
use rum_protocol::ServerConfig;
use serde_derive::Deserialize;
use tracing::{info, instrument};

/// Load a `Config` from an explicit TOML file path, falling back to
/// built-in defaults when no path is given.
#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let Some(config_path) = config_file else {
        return Ok(Config::default());
    };

    info!("parsing config file ({})", config_path);
    let config_str = fs::read_to_string(config_path).context("reading config toml")?;
    let config: Config = toml::from_str(&config_str).context("parsing config file")?;
    Ok(config)
}

/// Facade-level configuration: the knobs that are not server-controlled.
/// Everything the backend can override at runtime lives on `ServerConfig`
/// instead, and arrives via status responses.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// The application id reported on every HTTP request.
    pub application_id: String,

    /// The application version string reported on every HTTP request.
    pub application_version: String,

    /// Base URL of the analytics backend, e.g. `https://rum.example.com/mbeacon`.
    pub endpoint: String,

    /// Lower bound (bytes) the evictor drains `global_bytes` down to during
    /// a space-based eviction pass. `<= 0` disables space-based eviction.
    pub cache_lower_bound: i64,

    /// Upper bound (bytes) that triggers a space-based eviction pass.
    /// `<= 0`, or less than `cache_lower_bound`, disables space-based
    /// eviction.
    pub cache_upper_bound: i64,

    /// Records older than this many milliseconds are dropped by the
    /// time-based eviction strategy on every pass.
    pub max_record_age_ms: i64,

    /// Interval, in milliseconds, between evictor passes.
    pub eviction_interval_ms: i64,

    /// The config applied to sessions before the first successful status
    /// response is received.
    pub default_server_config: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            application_id: String::from("unknown-app"),
            application_version: String::from("0.0.0"),
            endpoint: String::from("https://localhost/mbeacon"),
            cache_lower_bound: 100 * 1024,
            cache_upper_bound: 200 * 1024,
            max_record_age_ms: 45 * 60 * 1000,
            eviction_interval_ms: 30_000,
            default_server_config: ServerConfig::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use ntest::timeout;

    use super::*;

    #[test]
    #[timeout(30000)]
    fn parse() -> anyhow::Result<()> {
        let cases = vec![
            r#"
            application_id = "com.example.app"
            endpoint = "https://rum.example.com/mbeacon"
            "#,
            r#"
            cache_lower_bound = 1000
            cache_upper_bound = 2000
            "#,
            r#"
            [default_server_config]
            capture = false
            multiplicity = 0
            "#,
        ];

        for case in cases.into_iter() {
            let _: Config = toml::from_str(case)?;
        }

        Ok(())
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let cfg = read_config(&None).expect("default config when no path given");
        assert_eq!(cfg.application_id, "unknown-app");
    }

    #[test]
    fn malformed_file_reports_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "cache_lower_bound = \"not a number\"").unwrap();
        let err = read_config(&Some(path.to_string_lossy().into_owned())).unwrap_err();
        assert!(format!("{:?}", err).contains("parsing config file"));
    }
}
