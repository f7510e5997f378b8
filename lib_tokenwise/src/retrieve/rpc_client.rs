//! # JSON-RPC Client
//!
//! A thin JSON-RPC 2.0 client for the chain data provider. The HTTP exchange sits
//! behind the `RpcTransport` trait so the retry behaviour can be exercised without
//! a network; `HttpTransport` is the production implementation built on `reqwest`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::RpcError;
use crate::retrieve::retry::RetryPolicy;

/// One request/response exchange with the RPC Source.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Posts a JSON-RPC envelope and returns the decoded response body.
    async fn post(&self, body: &Value) -> Result<Value, RpcError>;
}

/// `reqwest`-backed transport.
///
/// Idle connections are not pooled, so every attempt opens a fresh connection whose
/// lifetime is bounded by the request timeout.
pub struct HttpTransport {
    inner: reqwest::Client,
    url: reqwest::Url,
}

impl HttpTransport {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self, RpcError> {
        let url = reqwest::Url::parse(url).map_err(|e| RpcError::Transport(format!("invalid RPC url: {e}")))?;
        let inner = reqwest::Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(0)
            .user_agent("TokenWise/1.0")
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self { inner, url })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn post(&self, body: &Value) -> Result<Value, RpcError> {
        let response = self
            .inner
            .post(self.url.clone())
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RpcError::RateLimited);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RpcError::Transport(format!("HTTP {}: {}", status.as_u16(), truncate(&detail, 200))));
        }

        response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout
            } else {
                RpcError::Malformed(e.to_string())
            }
        })
    }
}

fn classify_reqwest(err: reqwest::Error) -> RpcError {
    if err.is_timeout() {
        RpcError::Timeout
    } else {
        RpcError::Transport(err.to_string())
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// JSON-RPC client with a uniform retry policy.
pub struct RpcClient {
    transport: Arc<dyn RpcTransport>,
    policy: RetryPolicy,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn RpcTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            next_id: AtomicU64::new(1),
        }
    }

    /// Builds an HTTP client for `url` using the policy's attempt timeout.
    pub fn http(url: &str, policy: RetryPolicy) -> Result<Self, RpcError> {
        let transport = HttpTransport::new(url, policy.attempt_timeout)?;
        Ok(Self::new(Arc::new(transport), policy))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Calls `method` with the client's default policy.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.call_with_policy(method, params, &self.policy).await
    }

    /// Calls `method`, retrying transient failures according to `policy`.
    ///
    /// A JSON-RPC `error` object is surfaced as `RpcError::Remote` on the first
    /// attempt that carries it.
    pub async fn call_with_policy(&self, method: &str, params: Value, policy: &RetryPolicy) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        policy
            .run(method, |attempt| {
                let body = &body;
                async move {
                    debug!(method, attempt = attempt + 1, "RPC call");
                    let response = self.transport.post(body).await?;
                    unwrap_envelope(response)
                }
            })
            .await
    }
}

/// Extracts `result` from a JSON-RPC response, or the remote error.
fn unwrap_envelope(mut response: Value) -> Result<Value, RpcError> {
    if let Some(err) = response.get("error").filter(|e| !e.is_null()) {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown RPC error")
            .to_string();
        return Err(RpcError::Remote { code, message });
    }
    match response.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(RpcError::Malformed("response carries neither result nor error".into())),
    }
}
