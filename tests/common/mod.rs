//! Shared fixtures: an in-process ingest endpoint and a scratch sample store.

#![allow(dead_code)]

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use wearsync::ingest_client::IngestRequest;
use wearsync::{NewSample, SampleStore, SourceTag, StoreOptions};

/// One request as seen by the fake endpoint.
#[derive(Debug, Clone)]
pub struct Captured {
    pub path: String,
    pub query: String,
    pub request: IngestRequest,
}

/// Fake ingest endpoint answering every POST with a fixed response.
pub struct IngestServer {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<Captured>>>,
    _shutdown: oneshot::Sender<()>,
}

impl IngestServer {
    pub async fn start(status: u16, body: &'static str) -> Self {
        Self::start_with_delay(status, body, Duration::ZERO).await
    }

    pub async fn start_with_delay(status: u16, body: &'static str, delay: Duration) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&requests);

        let make_service = make_service_fn(move |_conn| {
            let captured = Arc::clone(&captured);
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let captured = Arc::clone(&captured);
                    async move {
                        let path = req.uri().path().to_string();
                        let query = req.uri().query().unwrap_or_default().to_string();
                        let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
                        let request: IngestRequest = serde_json::from_slice(&bytes).unwrap();
                        captured.lock().push(Captured {
                            path,
                            query,
                            request,
                        });

                        tokio::time::sleep(delay).await;
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .header("Content-Type", "application/json")
                                .body(Body::from(body))
                                .unwrap(),
                        )
                    }
                }))
            }
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_service);
        let addr = server.local_addr();
        tokio::spawn(server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        }));

        Self {
            addr,
            requests,
            _shutdown: shutdown_tx,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn received(&self) -> Vec<Captured> {
        self.requests.lock().clone()
    }
}

/// Base URL of a local port nothing listens on.
pub fn refused_base_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub fn scratch_store() -> (TempDir, Arc<SampleStore>) {
    let dir = TempDir::new().unwrap();
    let store = SampleStore::open(
        dir.path().join("samples.journal"),
        StoreOptions {
            compact_after: 1000,
            fsync: false,
        },
    )
    .unwrap();
    (dir, Arc::new(store))
}

pub fn vitals(source: SourceTag, heart_rate: f64, spo2: f64) -> NewSample {
    NewSample {
        user_id: "user_01".into(),
        team_id: "default".into(),
        device_id: source.default_device_id().into(),
        source,
        timestamp_millis: 1_700_000_000_000,
        battery_pct: 77.0,
        heart_rate,
        spo2,
        temperature: 36.6,
        raw_payload_echo: String::new(),
    }
}
