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

//! The one concrete `HttpClient` implementation shipped with this core,
//! wrapping `ureq`'s blocking client to match the rest of the codebase's
//! synchronous, thread-per-worker style. Host applications are free to
//! substitute their own implementation of the trait.

use std::{collections::HashMap, io::Read};

use anyhow::Context;
use rum_protocol::{BeaconRequest, HttpClient, HttpResponse, StatusRequest};

pub struct UreqHttpClient {
    endpoint: String,
    agent: ureq::Agent,
}

impl UreqHttpClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        UreqHttpClient { endpoint: endpoint.into(), agent: ureq::AgentBuilder::new().build() }
    }

    fn status_url(&self, req: &StatusRequest) -> String {
        format!(
            "{}?type=m&srvid={}&app={}&va={}{}",
            self.endpoint,
            req.server_id,
            req.app_id,
            req.app_version,
            if req.is_new_session { "&ns=1" } else { "" },
        )
    }

    fn to_response(resp: ureq::Response) -> anyhow::Result<HttpResponse> {
        let status = resp.status();
        let mut headers = HashMap::new();
        for name in resp.headers_names() {
            if let Some(value) = resp.header(&name) {
                headers.insert(name, value.to_string());
            }
        }
        let mut body = Vec::new();
        resp.into_reader().read_to_end(&mut body).context("reading response body")?;
        Ok(HttpResponse { status, headers, body })
    }

    fn from_ureq_error(err: ureq::Error) -> anyhow::Result<HttpResponse> {
        match err {
            ureq::Error::Status(_, resp) => Self::to_response(resp),
            ureq::Error::Transport(t) => Err(anyhow::anyhow!(t).context("http transport error")),
        }
    }
}

impl HttpClient for UreqHttpClient {
    fn send_status_request(&self, req: &StatusRequest) -> anyhow::Result<HttpResponse> {
        let url = self.status_url(req);
        match self.agent.get(&url).call() {
            Ok(resp) => Self::to_response(resp),
            Err(e) => Self::from_ureq_error(e),
        }
    }

    fn send_new_session_request(&self, req: &StatusRequest) -> anyhow::Result<HttpResponse> {
        self.send_status_request(req)
    }

    fn send_beacon_request(&self, req: &BeaconRequest) -> anyhow::Result<HttpResponse> {
        let url = format!("{}?type=m&srvid={}", self.endpoint, req.server_id);
        let mut request = self.agent.post(&url);
        if let Some(ip) = &req.client_ip {
            request = request.set("X-Client-IP", ip);
        }
        match request.send_bytes(&req.body) {
            Ok(resp) => Self::to_response(resp),
            Err(e) => Self::from_ureq_error(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_url_includes_new_session_discriminator() {
        let client = UreqHttpClient::new("https://example.com/rum");
        let req = StatusRequest { server_id: 1, app_id: "a".into(), app_version: "1.0".into(), is_new_session: true };
        assert!(client.status_url(&req).ends_with("&ns=1"));
    }

    #[test]
    fn status_url_omits_discriminator_for_plain_status() {
        let client = UreqHttpClient::new("https://example.com/rum");
        let req = StatusRequest { server_id: 1, app_id: "a".into(), app_version: "1.0".into(), is_new_session: false };
        assert!(!client.status_url(&req).ends_with("&ns=1"));
    }
}
