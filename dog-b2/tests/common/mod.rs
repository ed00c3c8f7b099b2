//! Scripted in-memory B2 server shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use dog_b2::{
    sha1_hex, B2Client, B2Config, B2Credentials, B2Error, B2Result, HttpRequest, HttpResponse, HttpTransport,
    RetryPolicy,
};

pub const API_URL: &str = "https://api.mock.b2";
pub const BUCKET: &str = "bucket-1";

/// One scripted answer for a route
#[derive(Debug, Clone)]
pub enum Reply {
    /// What a healthy server would answer
    Default,
    Status(u16, &'static str, &'static str),
    Json(Value),
    Disconnect,
}

#[derive(Default)]
struct MockState {
    requests: Vec<(String, HttpRequest)>,
    scripts: HashMap<String, VecDeque<Reply>>,
    latency: HashMap<String, Duration>,
    counters: HashMap<String, u64>,
    in_flight: HashMap<String, usize>,
    overlapping: usize,
}

/// `HttpTransport` that plays the B2 API.
///
/// Routes are the API operation names (`b2_get_upload_url`, ...) plus
/// `upload_file` and `upload_part` for payload uploads.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue replies consumed by the next calls to `route`
    pub fn script(&self, route: &str, replies: impl IntoIterator<Item = Reply>) {
        self.state
            .lock()
            .scripts
            .entry(route.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn set_latency(&self, route: &str, latency: Duration) {
        self.state.lock().latency.insert(route.to_string(), latency);
    }

    pub fn count(&self, route: &str) -> usize {
        self.state.lock().requests.iter().filter(|(r, _)| r == route).count()
    }

    pub fn requests(&self, route: &str) -> Vec<HttpRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(r, _)| r == route)
            .map(|(_, req)| req.clone())
            .collect()
    }

    /// Times an upload URL was used while another upload on it was running
    pub fn overlapping_uses(&self) -> usize {
        self.state.lock().overlapping
    }

    fn next_number(state: &mut MockState, route: &str) -> u64 {
        let counter = state.counters.entry(route.to_string()).or_default();
        *counter += 1;
        *counter
    }

    fn default_reply(state: &mut MockState, route: &str, request: &HttpRequest) -> Value {
        let n = Self::next_number(state, route);
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        match route {
            "b2_authorize_account" => json!({
                "accountId": "account-1",
                "authorizationToken": format!("token-{}", n),
                "apiUrl": API_URL,
                "downloadUrl": "https://f000.mock.b2",
                "recommendedPartSize": 100 * 1024 * 1024,
                "absoluteMinimumPartSize": 5 * 1024 * 1024,
                "allowed": { "capabilities": ["listBuckets", "writeFiles"], "bucketId": null }
            }),
            "b2_get_upload_url" => {
                let bucket = body["bucketId"].as_str().unwrap_or_default().to_string();
                json!({
                    "bucketId": bucket,
                    "uploadUrl": format!("https://pod.mock.b2/upload/{}/{}", bucket, n),
                    "authorizationToken": format!("upload-token-{}", n)
                })
            }
            "b2_get_upload_part_url" => {
                let file_id = body["fileId"].as_str().unwrap_or_default().to_string();
                json!({
                    "fileId": file_id,
                    "uploadUrl": format!("https://pod.mock.b2/upload_part/{}/{}", file_id, n),
                    "authorizationToken": format!("part-token-{}", n)
                })
            }
            "upload_file" => json!({
                "fileId": format!("small-{}", n),
                "fileName": request.header("X-Bz-File-Name").unwrap_or_default(),
                "contentLength": request.body.len(),
                "contentSha1": sha1_hex(&request.body),
                "contentType": request.header("Content-Type").unwrap_or_default(),
                "action": "upload"
            }),
            "b2_start_large_file" => json!({
                "fileId": format!("large-{}", n),
                "fileName": body["fileName"],
                "contentType": body["contentType"],
                "action": "start"
            }),
            "upload_part" => json!({
                "fileId": request.url.split('/').nth(4).unwrap_or_default(),
                "partNumber": request.header("X-Bz-Part-Number").and_then(|p| p.parse::<u32>().ok()).unwrap_or_default(),
                "contentLength": request.body.len(),
                "contentSha1": sha1_hex(&request.body)
            }),
            "b2_finish_large_file" => json!({
                "fileId": body["fileId"],
                "fileName": "finished",
                "contentSha1": "none",
                "action": "upload"
            }),
            "b2_cancel_large_file" => json!({ "fileId": body["fileId"], "fileName": "cancelled" }),
            _ => json!({}),
        }
    }
}

pub fn route_of(url: &str) -> String {
    if let Some((_, op)) = url.split_once("/b2api/v2/") {
        op.to_string()
    } else if url.contains("/upload_part/") {
        "upload_part".to_string()
    } else if url.contains("/upload/") {
        "upload_file".to_string()
    } else {
        "unknown".to_string()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> B2Result<HttpResponse> {
        let route = route_of(&request.url);
        let uploads = route == "upload_file" || route == "upload_part";

        let (reply, latency) = {
            let mut state = self.state.lock();
            state.requests.push((route.clone(), request.clone()));
            if uploads {
                let running = state.in_flight.entry(request.url.clone()).or_default();
                *running += 1;
                if *running > 1 {
                    state.overlapping += 1;
                }
            }
            let reply = state
                .scripts
                .get_mut(&route)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Reply::Default);
            (reply, state.latency.get(&route).copied())
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if uploads {
            if let Some(running) = state.in_flight.get_mut(&request.url) {
                *running -= 1;
            }
        }

        match reply {
            Reply::Default => {
                let body = Self::default_reply(&mut state, &route, &request);
                Ok(HttpResponse::new(200, serde_json::to_vec(&body)?))
            }
            Reply::Json(body) => Ok(HttpResponse::new(200, serde_json::to_vec(&body)?)),
            Reply::Status(status, code, message) => {
                let body = json!({ "status": status, "code": code, "message": message });
                Ok(HttpResponse::new(status, serde_json::to_vec(&body)?))
            }
            Reply::Disconnect => Err(B2Error::connection("connection reset by peer")),
        }
    }
}

pub fn credentials() -> B2Credentials {
    B2Credentials::new("key-id", "application-key")
}

/// Small chunks and no backoff so failures play out instantly
pub fn test_config(chunk_size: u64) -> B2Config {
    B2Config::new()
        .with_chunk_size(chunk_size)
        .with_retry(RetryPolicy::new().with_max_attempts(3).immediate())
}

pub async fn connect(mock: &Arc<MockTransport>, config: B2Config) -> B2Client {
    B2Client::connect_with_transport(mock.clone(), credentials(), config)
        .await
        .expect("mock connect")
}

/// Deterministic, non-repeating-per-chunk payload
pub fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn json_body(request: &HttpRequest) -> Value {
    serde_json::from_slice(&request.body).expect("json body")
}
