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

//! A thin demonstration binary: parse args, load config, wire the facade
//! against a real `ureq` client, drive one session from synthetic
//! instrumentation calls, and print cache/session statistics on an
//! interval. Everything else lives in `librum`.

use std::{sync::Arc, thread, time::Duration};

use clap::Parser;
use librum::build_facade;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[clap(author, about, version = VERSION)]
struct Args {
    #[clap(short, long, action, help = "a toml file containing configuration")]
    config_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    verbose: u8,

    #[clap(long, default_value_t = 20, help = "number of synthetic actions to report before exiting")]
    actions: u32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    librum::init_logging(args.verbose);

    let config = librum::config::read_config(&args.config_file)?;
    let http_client: Arc<dyn rum_protocol::HttpClient> = Arc::new(librum::http::UreqHttpClient::new(config.endpoint.clone()));
    let facade = Arc::new(build_facade(&config, http_client));

    facade.initialize();
    if !facade.wait_for_init(Duration::from_secs(10)) {
        tracing::warn!("timed out waiting for the initial status handshake; continuing anyway");
    }

    let session = facade.create_session();
    for i in 0..args.actions {
        facade.with_session(session, |proxy| {
            proxy.enter_action(&format!("demo-action-{i}"), 0, 5);
        });
        thread::sleep(Duration::from_millis(100));
    }

    println!("cache bytes in flight: {}", facade.cache().num_bytes_in_cache());
    facade.end_session(session);
    facade.shutdown();
    Ok(())
}
