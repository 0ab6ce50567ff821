/* distrans - a lightweight relay fanning out conversion events to marketing APIs
 * Copyright (C) 2023 Withings
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>. */

//! Test helpers: a recording HTTP server standing in for destination APIs

use crate::events::Envelope;
use crate::events::context::ClientContext;
use crate::events::payload::InboundPayload;

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use bytes::Bytes;
use chrono::Utc;
use warp::Filter;
use warp::http::{HeaderMap, Method, StatusCode};
use warp::path::FullPath;

/// A request as received by the mock server
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RecordedRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("recorded body is not JSON")
    }

    pub fn query_pairs(&self) -> HashMap<String, String> {
        Self::decode_pairs(&self.query)
    }

    pub fn form(&self) -> HashMap<String, String> {
        Self::decode_pairs(&self.body)
    }

    fn decode_pairs(encoded: &str) -> HashMap<String, String> {
        let url = reqwest::Url::parse(&format!("http://localhost/?{}", encoded)).expect("bad query string");
        url.query_pairs().into_owned().collect()
    }
}

/// Canned reply, per path prefix
#[derive(Clone)]
struct Canned {
    status: u16,
    body: String,
}

#[derive(Default)]
struct Behaviour {
    default: Option<Canned>,
    by_prefix: Vec<(String, Canned)>,
    delay: Duration,
    delay_by_prefix: Vec<(String, Duration)>,
}

impl Behaviour {
    fn reply_for(&self, path: &str) -> (Canned, Duration) {
        let canned = self.by_prefix.iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, c)| c.clone())
            .or_else(|| self.default.clone())
            .unwrap_or(Canned { status: 200, body: String::from("{}") });
        let delay = self.delay_by_prefix.iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, d)| *d)
            .unwrap_or(self.delay);
        (canned, delay)
    }
}

/// A local HTTP server recording everything it receives
pub struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    behaviour: Arc<Mutex<Behaviour>>,
}

impl MockServer {
    pub async fn start() -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let behaviour = Arc::new(Mutex::new(Behaviour::default()));

        let route_requests = requests.clone();
        let route_behaviour = behaviour.clone();
        let route = warp::any()
            .and(warp::method())
            .and(warp::path::full())
            .and(warp::query::raw().or(warp::any().map(String::new)).unify())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(move |method: Method, path: FullPath, query: String, headers: HeaderMap, body: Bytes| {
                let requests = route_requests.clone();
                let behaviour = route_behaviour.clone();
                async move {
                    requests.lock().unwrap().push(RecordedRequest {
                        method: method.to_string(),
                        path: path.as_str().to_string(),
                        query,
                        headers: headers.iter()
                            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                            .collect(),
                        body: String::from_utf8_lossy(&body).to_string(),
                    });

                    let (canned, delay) = behaviour.lock().unwrap().reply_for(path.as_str());
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }

                    let status = StatusCode::from_u16(canned.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    Ok::<_, Infallible>(warp::reply::with_status(canned.body, status))
                }
            });

        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        Self { addr, requests, behaviour }
    }

    /// Base URL of the server, with a path appended
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Replies with this status and body to everything not matched by a prefix
    pub fn respond_with(&self, status: u16, body: &str) {
        self.behaviour.lock().unwrap().default = Some(Canned { status, body: body.to_string() });
    }

    /// Replies with this status and body to paths starting with a prefix
    pub fn respond_on(&self, prefix: &str, status: u16, body: &str) {
        self.behaviour.lock().unwrap().by_prefix.push((prefix.to_string(), Canned { status, body: body.to_string() }));
    }

    /// Waits this long before replying to anything
    pub fn delay_by(&self, delay: Duration) {
        self.behaviour.lock().unwrap().delay = delay;
    }

    /// Waits this long before replying to paths starting with a prefix
    pub fn delay_on(&self, prefix: &str, delay: Duration) {
        self.behaviour.lock().unwrap().delay_by_prefix.push((prefix.to_string(), delay));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Builds an envelope from a JSON body, a query string map and a client context
pub fn envelope(body: serde_json::Value, query: &[(&str, &str)], client: ClientContext) -> Envelope {
    let payload: InboundPayload = serde_json::from_value(body).expect("invalid test payload");
    let mut client = client;
    client.cookies = payload.cookie.clone().or(client.cookies);
    Envelope {
        request_id: Some(String::from("test")),
        client,
        query: query.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        payload,
    }
}

/// A browser-ish client context
pub fn browser() -> ClientContext {
    ClientContext {
        ip: Some(String::from("203.0.113.7")),
        user_agent: Some(String::from("Mozilla/5.0 (X11; Linux x86_64)")),
        ..Default::default()
    }
}

/// RFC 3339 timestamp some seconds ago
pub fn seconds_ago(seconds: i64) -> String {
    (Utc::now() - chrono::Duration::seconds(seconds)).to_rfc3339()
}
