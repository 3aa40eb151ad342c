//! HTTP callback invocation.

use std::time::Duration;

use async_trait::async_trait;

use crate::timer::NotifyHttpParam;

/// Error from a callback invocation, with the timeout case kept distinct
/// so the notify stage can classify history rows.
#[derive(Debug)]
pub struct CallbackError {
    pub message: String,
    pub timed_out: bool,
}

impl CallbackError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: true,
        }
    }
}

/// Result of a callback: response body on success.
pub type CallbackResult = std::result::Result<String, CallbackError>;

/// Invokes a definition's registered callback, respecting the deadline.
#[async_trait]
pub trait CallbackInvoker: Send + Sync {
    async fn call(&self, param: &NotifyHttpParam, deadline: Duration) -> CallbackResult;
}

/// reqwest-backed invoker.
#[derive(Clone, Default)]
pub struct HttpCallback {
    client: reqwest::Client,
}

impl HttpCallback {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallbackInvoker for HttpCallback {
    async fn call(&self, param: &NotifyHttpParam, deadline: Duration) -> CallbackResult {
        let mut req = match param.method.to_uppercase().as_str() {
            "POST" => self.client.post(&param.url),
            "PUT" => self.client.put(&param.url),
            "DELETE" => self.client.delete(&param.url),
            _ => self.client.get(&param.url),
        };

        for (key, value) in &param.header {
            req = req.header(key.as_str(), value.as_str());
        }
        if !param.body.is_empty() {
            req = req
                .header("Content-Type", "application/json")
                .body(param.body.clone());
        }

        let resp = req.timeout(deadline).send().await.map_err(|e| {
            if e.is_timeout() {
                CallbackError::timeout(e.to_string())
            } else {
                CallbackError::failed(e.to_string())
            }
        })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(body)
        } else {
            Err(CallbackError::failed(format!(
                "callback returned {}: {}",
                status, body
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = CallbackError::timeout("deadline exceeded");
        assert!(err.timed_out);
        let err = CallbackError::failed("500");
        assert!(!err.timed_out);
    }
}
