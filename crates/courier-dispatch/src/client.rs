//! HTTP client for merchant callback delivery.
//!
//! Posts the JSON webhook body to the merchant endpoint with a per-request
//! timeout and classifies the outcome for the ledger.

use std::time::{Duration, Instant};

use bytes::Bytes;
use courier_core::models::{CallbackLogId, TransactionId};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Largest response body kept for the ledger.
const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;

/// Truncated size when a response exceeds the limit.
const MAX_AUDIT_SIZE: usize = 1024;

/// Configuration for the delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for a single request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Courier-Webhook-Delivery/1.0".to_string(),
            max_redirects: 3,
        }
    }
}

/// Pooled HTTP client used for every merchant callback.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// One outbound callback attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Ledger row this attempt belongs to.
    pub callback_log_id: CallbackLogId,
    /// Transaction being reported.
    pub txn_id: TransactionId,
    /// Merchant endpoint.
    pub url: String,
    /// JSON body.
    pub body: Bytes,
    /// 1-based attempt number.
    pub attempt_number: u32,
}

/// Merchant response to a callback.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated if oversized.
    pub body: String,
    /// Time taken by the request.
    pub duration: Duration,
}

impl DeliveryResponse {
    /// Whether the merchant accepted the callback.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

impl DeliveryClient {
    /// Creates a delivery client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Configured request timeout.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Posts the callback and returns the merchant's response, whatever its
    /// status.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `NetworkError` when no response was received.
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "callback_delivery",
            callback_log_id = %request.callback_log_id,
            txn_id = %request.txn_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            let start_time = Instant::now();
            debug!("sending callback");

            let result = self
                .client
                .post(&request.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header("X-Courier-Delivery-Id", request.callback_log_id.to_string())
                .header("X-Courier-Transaction-Id", request.txn_id.to_string())
                .header("X-Courier-Attempt", request.attempt_number.to_string())
                .body(request.body)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    warn!(duration_ms = start_time.elapsed().as_millis() as u64, error = %e, "request failed");
                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    if e.is_builder() {
                        return Err(DeliveryError::configuration(e.to_string()));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let delivery_response = read_response(response, start_time.elapsed()).await;
            debug!(
                status = delivery_response.status_code,
                duration_ms = delivery_response.duration.as_millis() as u64,
                "received response"
            );

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }
}

async fn read_response(response: Response, duration: Duration) -> DeliveryResponse {
    let status_code = response.status().as_u16();

    let body = match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_SIZE => {
            let suffix = "... (truncated)";
            let truncated = String::from_utf8_lossy(&bytes[..MAX_AUDIT_SIZE - suffix.len()]);
            format!("{truncated}{suffix}")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(error = %e, "failed to read response body");
            format!("[failed to read response body: {e}]")
        },
    };

    DeliveryResponse { status_code, body, duration }
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request_to(url: String) -> DeliveryRequest {
        DeliveryRequest {
            callback_log_id: CallbackLogId::new(),
            txn_id: TransactionId::new(),
            url,
            body: Bytes::from(r#"{"status":"SUCCESS"}"#),
            attempt_number: 1,
        }
    }

    #[tokio::test]
    async fn successful_delivery() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/webhook"))
            .and(matchers::header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(request_to(format!("{}/webhook", mock_server.uri()))).await;

        let response = response.unwrap();
        assert_eq!(response.status_code, 200);
        assert!(response.is_success());
        assert_eq!(response.body, "OK");
    }

    #[tokio::test]
    async fn server_error_is_a_response_not_an_error() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let url = format!("{}/webhook", mock_server.uri());

        let response = client.deliver(request_to(url)).await.unwrap();
        assert_eq!(response.status_code, 500);
        assert!(!response.is_success());

        let err = DeliveryError::from_status(response.status_code, response.body);
        assert!(matches!(err, DeliveryError::ServerError { status_code: 500, .. }));
        assert_eq!(err.response_body(), Some("Internal Server Error"));
    }

    #[tokio::test]
    async fn delivery_metadata_headers_added() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::header_exists("X-Courier-Delivery-Id"))
            .and(matchers::header_exists("X-Courier-Transaction-Id"))
            .and(matchers::header("X-Courier-Attempt", "1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response =
            client.deliver(request_to(format!("{}/webhook", mock_server.uri()))).await.unwrap();
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::new(ClientConfig {
            timeout: Duration::from_millis(100),
            ..ClientConfig::default()
        })
        .unwrap();

        let err = client
            .deliver(request_to(format!("{}/webhook", mock_server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_error() {
        let client = DeliveryClient::with_defaults().unwrap();
        let err = client.deliver(request_to("http://127.0.0.1:1/webhook".into())).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NetworkError { .. }));
    }
}
