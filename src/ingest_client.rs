//! Protocol adapter for the remote ingest endpoint.
//!
//! A batch is serialized into one JSON request and POSTed to
//! `{base_url}/ingest?api_key={api_key}`. The exchange is atomic from the
//! caller's point of view: the whole batch is accepted or none of it is.
//!
//! | Response                         | Outcome            |
//! |----------------------------------|--------------------|
//! | 2xx, body `{"ok": false, ...}`   | `Rejected`         |
//! | any other 2xx                    | `Accepted`         |
//! | non-2xx status                   | `TransportFailure` |
//! | connect error / timeout          | `TransportFailure` |

use crate::error::TransportError;
use crate::sample::{Sample, SourceTag};
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The endpoint explicitly acknowledged the whole batch.
    Accepted,
    /// The endpoint answered but refused the batch.
    Rejected(String),
    /// No usable answer: connection error, timeout or non-success status.
    TransportFailure(String),
}

/// Request body sent to the ingest endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Wearer id.
    pub uid: String,
    /// Team id.
    pub team: String,
    /// Samples in id order.
    pub packets: Vec<WirePacket>,
}

/// One sample as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct WirePacket {
    pub did: String,
    pub ts: i64,
    pub src: SourceTag,
    pub batt: f64,
    pub temp: f64,
    pub vitals: WireVitals,
}

/// Vital signs of one wire packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct WireVitals {
    pub hr: f64,
    pub spo2: f64,
}

impl IngestRequest {
    /// Build the request for a batch, preserving batch order.
    pub fn from_batch(user_id: &str, team_id: &str, batch: &[Sample]) -> Self {
        Self {
            uid: user_id.to_string(),
            team: team_id.to_string(),
            packets: batch
                .iter()
                .map(|s| WirePacket {
                    did: s.device_id.clone(),
                    ts: s.timestamp_millis,
                    src: s.source,
                    batt: s.battery_pct,
                    temp: s.temperature,
                    vitals: WireVitals {
                        hr: s.heart_rate,
                        spo2: s.spo2,
                    },
                })
                .collect(),
        }
    }
}

/// Sends sample batches to the remote endpoint.
///
/// Implementations must never report `Accepted` without an explicit success
/// signal, and must bound their own waiting (timeouts surface as
/// `TransportFailure`).
#[async_trait]
pub trait IngestClient: Send + Sync {
    /// Send one batch for the given partition tags.
    async fn send(&self, user_id: &str, team_id: &str, batch: &[Sample]) -> IngestOutcome;
}

/// [`IngestClient`] over HTTP/1.1.
#[derive(Debug, Clone)]
pub struct HttpIngestClient {
    client: Client<HttpConnector, Body>,
    endpoint: Uri,
    timeout: Duration,
}

impl HttpIngestClient {
    /// Create a client for `base_url` (e.g. `http://10.0.2.2:8000`).
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, TransportError> {
        let url = format!("{}/ingest?api_key={}", base_url.trim_end_matches('/'), api_key);
        let endpoint: Uri = url
            .parse()
            .map_err(|_| TransportError::InvalidUrl(url.clone()))?;
        if endpoint.scheme_str() != Some("http") || endpoint.host().is_none() {
            return Err(TransportError::InvalidUrl(url));
        }

        Ok(Self {
            client: Client::new(),
            endpoint,
            timeout,
        })
    }

    /// Full request URI, including the api key query.
    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    async fn post(&self, body: Vec<u8>) -> Result<(StatusCode, hyper::body::Bytes), TransportError> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))?;

        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<_, TransportError>((status, bytes))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout.as_millis() as u64))?
    }
}

#[async_trait]
impl IngestClient for HttpIngestClient {
    async fn send(&self, user_id: &str, team_id: &str, batch: &[Sample]) -> IngestOutcome {
        let request = IngestRequest::from_batch(user_id, team_id, batch);
        let body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(e) => return IngestOutcome::Rejected(format!("cannot encode batch: {e}")),
        };

        match self.post(body).await {
            Ok((status, bytes)) => interpret_response(status, &bytes),
            Err(e) => {
                tracing::warn!(error = %e, batch_len = batch.len(), "Ingest request failed");
                IngestOutcome::TransportFailure(e.to_string())
            }
        }
    }
}

/// Map an HTTP answer onto an outcome.
pub fn interpret_response(status: StatusCode, body: &[u8]) -> IngestOutcome {
    if !status.is_success() {
        return IngestOutcome::TransportFailure(
            TransportError::Status(status.as_u16()).to_string(),
        );
    }

    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return IngestOutcome::Accepted;
    };
    if value.get("ok") == Some(&serde_json::Value::Bool(false)) {
        let reason = value
            .get("detail")
            .or_else(|| value.get("error"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("endpoint reported ok=false");
        return IngestOutcome::Rejected(reason.to_string());
    }
    IngestOutcome::Accepted
}
