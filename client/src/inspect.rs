//! §4.M Inspection Buffer — a bounded ring of the most recent
//! `InspectRecord`s shipped down from the server, plus the replay engine
//! that re-dials the local service an inspected request was originally
//! proxied to.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tunnelcow_protocol::InspectRecord;

const CAPACITY: usize = 100;
const REPLAY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("no inspection record with that id")]
    NotFound,
    #[error("public port {0} has no local tunnel mapping")]
    NoLocalMapping(u16),
    #[error("request could not be reconstructed: {0}")]
    BadRequest(String),
    #[error("replay request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
pub struct ReplayResult {
    pub status: String,
    pub status_code: u16,
    pub replayed_to: String,
}

/// `Append`-only ring of capacity 100 (spec §4.L), keyed to the sole
/// client — there is exactly one buffer per process.
pub struct InspectionBuffer {
    records: Mutex<VecDeque<InspectRecord>>,
    http_client: reqwest::Client,
}

impl Default for InspectionBuffer {
    fn default() -> Self {
        InspectionBuffer {
            records: Mutex::new(VecDeque::with_capacity(CAPACITY)),
            http_client: reqwest::Client::new(),
        }
    }
}

impl InspectionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes `rec`, trimming the oldest entry once capacity is exceeded.
    pub fn append(&self, rec: InspectRecord) {
        let mut records = self.records.lock().unwrap();
        if records.len() >= CAPACITY {
            records.pop_front();
        }
        records.push_back(rec);
    }

    /// A snapshot copy of everything currently retained, newest last.
    pub fn get(&self) -> Vec<InspectRecord> {
        self.records.lock().unwrap().iter().cloned().collect()
    }

    fn find(&self, id: &str) -> Option<InspectRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Re-dials the local service the original request was proxied to.
    /// Per the "no id / no local mapping ⇒ no network I/O" invariant,
    /// both lookups happen before any request is built or sent.
    pub async fn replay(
        &self,
        id: &str,
        local_port: impl Fn(u16) -> Option<u16>,
    ) -> Result<ReplayResult, ReplayError> {
        let rec = self.find(id).ok_or(ReplayError::NotFound)?;
        let port = local_port(rec.public_port)
            .ok_or(ReplayError::NoLocalMapping(rec.public_port))?;

        let original = url::Url::parse(&rec.url)
            .map_err(|e| ReplayError::BadRequest(e.to_string()))?;
        let path_and_query = match original.query() {
            Some(q) => format!("{}?{}", original.path(), q),
            None => original.path().to_string(),
        };
        let target = format!("http://127.0.0.1:{port}{path_and_query}");

        let method = reqwest::Method::from_bytes(rec.method.as_bytes())
            .map_err(|e| ReplayError::BadRequest(e.to_string()))?;
        let mut builder = self
            .http_client
            .request(method, &target)
            .timeout(REPLAY_TIMEOUT);

        for header in rec.req_headers.split(", ").filter(|h| !h.is_empty()) {
            if let Some((name, value)) = header.split_once(": ") {
                builder = builder.header(name, value);
            }
        }

        if !is_sentinel_body(&rec.req_body) {
            builder = builder.body(rec.req_body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();

        Ok(ReplayResult {
            status: status.to_string(),
            status_code: status.as_u16(),
            replayed_to: target,
        })
    }
}

fn is_sentinel_body(body: &str) -> bool {
    matches!(
        body,
        tunnelcow_protocol::inspect::REQUEST_BODY_TOO_LARGE
            | tunnelcow_protocol::inspect::RESPONSE_BODY_TOO_LARGE
            | tunnelcow_protocol::inspect::BINARY_REQUEST_BODY
            | tunnelcow_protocol::inspect::BINARY_RESPONSE_BODY
    ) || body.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, public_port: u16) -> InspectRecord {
        InspectRecord {
            id: id.to_string(),
            ts_millis: 0,
            method: "GET".to_string(),
            url: "http://api.example/ping".to_string(),
            req_headers: String::new(),
            req_body: String::new(),
            status: 200,
            res_headers: String::new(),
            res_body: "pong".to_string(),
            duration_ms: 5,
            client_ip: "127.0.0.1".to_string(),
            public_port,
        }
    }

    #[test]
    fn ring_trims_to_capacity() {
        let buf = InspectionBuffer::new();
        for i in 0..(CAPACITY + 10) {
            buf.append(sample(&i.to_string(), 9001));
        }
        assert_eq!(buf.get().len(), CAPACITY);
        assert_eq!(buf.get().first().unwrap().id, "10");
    }

    #[tokio::test]
    async fn replay_unknown_id_does_no_network_io() {
        let buf = InspectionBuffer::new();
        let err = buf.replay("missing", |_| Some(7001)).await.unwrap_err();
        assert!(matches!(err, ReplayError::NotFound));
    }

    #[tokio::test]
    async fn replay_without_local_mapping_does_no_network_io() {
        let buf = InspectionBuffer::new();
        buf.append(sample("abc", 9001));
        let err = buf.replay("abc", |_| None).await.unwrap_err();
        assert!(matches!(err, ReplayError::NoLocalMapping(9001)));
    }
}
