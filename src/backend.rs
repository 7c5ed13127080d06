//! Capability contract every inference backend satisfies, plus the HTTP implementation
//!
//! The gateway makes no assumption about model internals: a backend only has to
//! answer a health probe and turn a byte payload into a byte payload.

use async_trait::async_trait;
use axum::body::Bytes;
use std::time::Duration;

/// Successful backend reply, relayed verbatim to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl BackendReply {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            content_type: None,
            body: body.into(),
        }
    }
}

/// Ways a backend call can fail
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendFailure {
    /// The payload never reached the worker (connection refused, process gone)
    #[error("worker unreachable: {0}")]
    Unreachable(String),

    /// The worker accepted the request and then died or dropped the connection
    #[error("worker crashed: {0}")]
    Crashed(String),

    /// The model itself refused the input
    #[error("worker rejected request with status {status}")]
    Rejected { status: u16, body: Bytes },
}

/// Contract between the gateway and a model worker
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Process-local health check
    async fn health_check(&self) -> Result<(), BackendFailure>;

    /// Run one prediction
    async fn predict(&self, payload: Bytes) -> Result<BackendReply, BackendFailure>;
}

// ============================================================================
// HTTP implementation (TorchServe-style worker)
// ============================================================================

/// Talks to a worker exposing `GET /ping` and `POST /predictions/{model}` on loopback
pub struct HttpBackend {
    client: reqwest::Client,
    ping_url: String,
    predict_url: String,
    health_timeout: Duration,
}

impl HttpBackend {
    pub fn new(client: reqwest::Client, model_name: &str, port: u16) -> Self {
        Self {
            client,
            ping_url: format!("http://127.0.0.1:{}/ping", port),
            predict_url: format!("http://127.0.0.1:{}/predictions/{}", port, model_name),
            health_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    fn classify(err: reqwest::Error) -> BackendFailure {
        if err.is_connect() {
            BackendFailure::Unreachable(err.to_string())
        } else {
            BackendFailure::Crashed(err.to_string())
        }
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn health_check(&self) -> Result<(), BackendFailure> {
        let response = self
            .client
            .get(&self.ping_url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(BackendFailure::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }

    async fn predict(&self, payload: Bytes) -> Result<BackendReply, BackendFailure> {
        let response = self
            .client
            .post(&self.predict_url)
            .body(payload)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // A worker dying mid-body surfaces here, after the request was delivered
        let body = response
            .bytes()
            .await
            .map_err(|e| BackendFailure::Crashed(e.to_string()))?;

        if !status.is_success() {
            return Err(BackendFailure::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(BackendReply {
            status: status.as_u16(),
            content_type,
            body,
        })
    }
}
