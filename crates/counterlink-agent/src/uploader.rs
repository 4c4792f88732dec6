//! Uploader
//!
//! One POST per batch, no retries inside a cycle: a failed batch simply
//! stays on the device and goes out again next cycle. The server answers
//! with either a blanket acknowledgment or the list of files it accepted.

use crate::budget::ByteBudget;
use crate::config::AgentConfig;
use crate::error::{AgentError, UploadError};
use chrono::{DateTime, Utc};
use counterlink_common::checksum::payload_digest;
use counterlink_common::types::Batch;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Location of the counter, sent with every request
pub const HEADER_LOCATION_ID: &str = "X-Location-Id";

/// Batch id, stable across retransmissions of the same batch
pub const HEADER_BATCH_ID: &str = "X-Batch-Id";

/// Hex SHA-256 of the request body
pub const HEADER_CONTENT_SHA256: &str = "X-Content-Sha256";

/// What the server confirmed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgment {
    /// Every file in the batch
    Full,
    /// Only these files
    Files(BTreeSet<String>),
}

impl Acknowledgment {
    pub fn covers(&self, file_name: &str) -> bool {
        match self {
            Acknowledgment::Full => true,
            Acknowledgment::Files(files) => files.contains(file_name),
        }
    }
}

/// Successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub ack: Acknowledgment,
    pub bytes_sent: u64,
    pub status: u16,
}

/// Sends batches to the ingestion endpoint within the monthly byte budget
#[derive(Debug)]
pub struct Uploader {
    client: Client,
    server_url: String,
    auth_token: Option<String>,
    budget: ByteBudget,
    /// Charged per request on top of the body
    request_overhead: u64,
}

impl Uploader {
    pub fn new(
        server_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
        budget: ByteBudget,
    ) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("counterlink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(AgentError::Client)?;

        Ok(Self {
            client,
            server_url: server_url.into(),
            auth_token,
            budget,
            request_overhead: 0,
        })
    }

    /// Charge `bytes` per request for headers and connection setup
    pub fn with_request_overhead(mut self, bytes: u64) -> Self {
        self.request_overhead = bytes;
        self
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        let budget = ByteBudget::open(config.budget_path(), config.monthly_byte_budget)?;
        Ok(Self::new(
            config.server_url.clone(),
            config.auth_token.clone(),
            config.upload_timeout(),
            budget,
        )?
        .with_request_overhead(config.request_overhead_bytes))
    }

    pub fn budget(&self) -> &ByteBudget {
        &self.budget
    }

    /// Largest payload one request can carry this period
    pub fn sendable_bytes(&self, now: DateTime<Utc>) -> u64 {
        self.budget.remaining(now).saturating_sub(self.request_overhead)
    }

    /// POST `payload` (the compressed form of `batch`) and interpret the reply
    pub async fn upload(
        &mut self,
        batch: &Batch,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<UploadResult, UploadError> {
        let size = payload.len() as u64 + self.request_overhead;
        self.budget.check(size, now)?;

        let mut request = self
            .client
            .post(&self.server_url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .header(HEADER_LOCATION_ID, batch.location_id.to_string())
            .header(HEADER_BATCH_ID, batch.batch_id.to_string())
            .header(HEADER_CONTENT_SHA256, payload_digest(payload))
            .body(payload.to_vec());
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => return Err(UploadError::Connect(e)),
            Err(e) => {
                self.charge(size, now);
                return Err(if e.is_timeout() {
                    UploadError::Timeout(e)
                } else {
                    UploadError::Network(e)
                });
            },
        };
        self.charge(size, now);

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                UploadError::Timeout(e)
            } else {
                UploadError::Network(e)
            }
        })?;
        let ack = interpret_response(&body, batch)?;
        debug!(status = status.as_u16(), bytes = size, ?ack, "Batch acknowledged");

        Ok(UploadResult {
            ack,
            bytes_sent: size,
            status: status.as_u16(),
        })
    }

    fn charge(&mut self, bytes: u64, now: DateTime<Utc>) {
        // The bytes are gone either way; a failed write only loses accounting.
        if let Err(e) = self.budget.charge(bytes, now) {
            error!(error = %e, bytes, "Failed to persist budget usage");
        }
    }
}

/// Map a 2xx response body onto an acknowledgment.
///
/// Empty bodies and JSON objects without `ack` acknowledge everything;
/// `{"ack": [...]}` names the accepted files. Names not in the batch are
/// ignored.
pub fn interpret_response(body: &[u8], batch: &Batch) -> Result<Acknowledgment, UploadError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Acknowledgment::Full);
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| UploadError::MalformedResponse(format!("response is not JSON: {e}")))?;
    let Value::Object(object) = value else {
        return Err(UploadError::MalformedResponse("response is not a JSON object".to_string()));
    };

    match object.get("ack") {
        None | Some(Value::Bool(true)) => Ok(Acknowledgment::Full),
        Some(Value::Array(items)) => {
            let sources = batch.source_files();
            let mut files = BTreeSet::new();
            for item in items {
                let Some(name) = item.as_str() else {
                    return Err(UploadError::MalformedResponse(format!("ack entry {item} is not a file name")));
                };
                if sources.contains(&name) {
                    files.insert(name.to_string());
                } else {
                    warn!(file = name, batch_id = %batch.batch_id, "Server acknowledged a file not in the batch");
                }
            }
            Ok(Acknowledgment::Files(files))
        },
        Some(other) => Err(UploadError::MalformedResponse(format!("unexpected ack value {other}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use counterlink_common::types::{payload, VehiclePassageRecord};
    use tempfile::TempDir;
    use wiremock::matchers::{body_bytes, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn batch() -> Batch {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        Batch::new(
            9,
            ts,
            vec![
                VehiclePassageRecord::new(ts, 1, "A.CSV"),
                VehiclePassageRecord::new(ts, 2, "B.CSV"),
            ],
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    fn uploader(dir: &TempDir, url: String, limit: u64) -> Uploader {
        let budget = ByteBudget::open(dir.path().join("budget.json"), limit).unwrap();
        Uploader::new(url, Some("s3cret".to_string()), Duration::from_secs(5), budget).unwrap()
    }

    #[test]
    fn test_interpret_response() {
        let batch = batch();

        assert_eq!(interpret_response(b"", &batch).unwrap(), Acknowledgment::Full);
        assert_eq!(interpret_response(b" \n", &batch).unwrap(), Acknowledgment::Full);
        assert_eq!(interpret_response(br#"{"ok":true}"#, &batch).unwrap(), Acknowledgment::Full);

        let partial = interpret_response(br#"{"ack":["A.CSV","ZZZ.CSV"]}"#, &batch).unwrap();
        assert_eq!(partial, Acknowledgment::Files(BTreeSet::from(["A.CSV".to_string()])));
        assert!(partial.covers("A.CSV"));
        assert!(!partial.covers("B.CSV"));

        assert!(interpret_response(b"OK", &batch).is_err());
        assert!(interpret_response(b"[1,2]", &batch).is_err());
        assert!(interpret_response(br#"{"ack":"A.CSV"}"#, &batch).is_err());
        assert!(interpret_response(br#"{"ack":[1]}"#, &batch).is_err());
    }

    #[tokio::test]
    async fn test_upload_sends_headers_and_charges_budget() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let batch = batch();
        let body = payload::compress(&batch).unwrap();

        Mock::given(method("POST"))
            .and(path("/pi_upload"))
            .and(header("content-type", "application/json"))
            .and(header("content-encoding", "gzip"))
            .and(header("x-location-id", "9"))
            .and(header("x-batch-id", batch.batch_id.to_string().as_str()))
            .and(header("x-content-sha256", payload_digest(&body).as_str()))
            .and(header("authorization", "Bearer s3cret"))
            .and(header_exists("user-agent"))
            .and(body_bytes(body.clone()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut uploader = uploader(&dir, format!("{}/pi_upload", server.uri()), 10_000);
        let result = uploader.upload(&batch, &body, now()).await.unwrap();

        assert_eq!(result.ack, Acknowledgment::Full);
        assert_eq!(result.status, 200);
        assert_eq!(result.bytes_sent, body.len() as u64);
        assert_eq!(uploader.budget().used(now()), body.len() as u64);
    }

    #[tokio::test]
    async fn test_server_error_is_a_failure_but_still_charged() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut uploader = uploader(&dir, server.uri(), 10_000);
        let err = uploader.upload(&batch(), b"payload", now()).await.unwrap_err();

        assert!(matches!(err, UploadError::Status { status: 503 }));
        assert_eq!(uploader.budget().used(now()), 7);
    }

    #[tokio::test]
    async fn test_budget_refusal_sends_nothing() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut uploader = uploader(&dir, server.uri(), 4);
        let err = uploader.upload(&batch(), b"payload", now()).await.unwrap_err();

        assert!(err.is_budget_exceeded());
        assert_eq!(uploader.budget().used(now()), 0);
    }

    #[tokio::test]
    async fn test_request_overhead_is_charged_and_reserved() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut uploader = uploader(&dir, server.uri(), 1_000).with_request_overhead(400);
        assert_eq!(uploader.sendable_bytes(now()), 600);

        let result = uploader.upload(&batch(), b"payload", now()).await.unwrap();
        assert_eq!(result.bytes_sent, 407);
        assert_eq!(uploader.budget().used(now()), 407);
        assert_eq!(uploader.sendable_bytes(now()), 193);

        // Body fits the remainder, body plus overhead does not.
        let err = uploader.upload(&batch(), &[0u8; 300], now()).await.unwrap_err();
        assert!(err.is_budget_exceeded());
    }

    #[tokio::test]
    async fn test_connection_refused_is_not_charged() {
        let dir = TempDir::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/pi_upload", listener.local_addr().unwrap());
        drop(listener);

        let mut uploader = uploader(&dir, url, 10_000);
        let err = uploader.upload(&batch(), b"payload", now()).await.unwrap_err();

        assert_eq!(err.kind(), "connect");
        assert_eq!(uploader.budget().used(now()), 0);
    }
}
