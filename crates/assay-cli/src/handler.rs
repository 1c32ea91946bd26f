//! HTTP job handler: forwards each payload to an analysis service

use assay_queue::{HandlerError, JobHandler};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

/// Longest slice of a response body quoted in an error
const MAX_ERROR_BODY: usize = 200;

/// POSTs the job payload as JSON and returns the JSON response as the output
#[derive(Debug, Clone)]
pub struct HttpHandler {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpHandler {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Whether a failed HTTP status is worth another attempt
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[async_trait]
impl JobHandler for HttpHandler {
    async fn execute(
        &self,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| HandlerError::Retryable(format!("request failed: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let msg = format!("Status: {}, Body: {}", status, truncate(&body));
            return Err(if is_retryable_status(status) {
                HandlerError::Retryable(msg)
            } else {
                HandlerError::Permanent(msg)
            });
        }

        response
            .json()
            .await
            .map_err(|e| HandlerError::Permanent(format!("invalid response: {}", e.without_url())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNPROCESSABLE_ENTITY));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_error_body_is_truncated() {
        let long = "x".repeat(1000);
        assert_eq!(truncate(&long).len(), MAX_ERROR_BODY);
        assert_eq!(truncate("short"), "short");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable() {
        let handler =
            HttpHandler::new("http://127.0.0.1:1/analyze", Duration::from_secs(2)).unwrap();
        let err = handler
            .execute(&serde_json::json!({"file": "x.pdf"}))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.message().contains("x.pdf"));
    }
}
