//! Razorpay payment gateway adapter.
//!
//! Wraps the subset of the Orders API the checkout flow needs: order
//! creation, client-callback signature verification, and manual capture.
//! Callers see the `PaymentGateway` trait so tests can substitute a fake.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

use crate::config::RazorpayConfig;

/// Gateway failures, tagged so every call site can branch exhaustively.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Zero or otherwise unchargeable amount. Never retryable.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Network trouble or gateway-side outage. The caller may retry order
    /// creation from scratch; a capture must never be retried blindly.
    #[error("payment gateway unreachable: {0}")]
    Unavailable(String),

    /// The gateway understood the request and refused it.
    #[error("gateway rejected request: {code}: {description}")]
    Rejected { code: String, description: String },
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

impl From<GatewayError> for crate::error::AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::InvalidAmount(msg) => crate::error::AppError::InvalidAmount(msg),
            GatewayError::Unavailable(msg) => crate::error::AppError::GatewayUnavailable(msg),
            GatewayError::Rejected { code, description } => {
                crate::error::AppError::GatewayUnavailable(format!("{}: {}", code, description))
            }
        }
    }
}

/// Order as created at the gateway.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayOrder {
    pub id: String,
    /// Amount in the smallest currency unit.
    pub amount: u64,
    pub currency: String,
    pub receipt: Option<String>,
    pub status: Option<String>,
}

/// Outcome of a capture call. An already-captured payment is success from
/// the orchestrator's point of view, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureResult {
    Captured,
    AlreadyCaptured,
}

/// Success payload reported by the checkout widget.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentCallback {
    pub razorpay_order_id: String,
    pub razorpay_payment_id: String,
    pub razorpay_signature: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(
        &self,
        amount_minor: u64,
        currency: &str,
        receipt: &str,
        notes: Option<serde_json::Value>,
    ) -> Result<GatewayOrder, GatewayError>;

    /// Pure boolean gate over the widget's success payload. Returns `false`
    /// on any mismatch and never errors; it is not a trust oracle by itself.
    fn verify_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool;

    async fn capture(
        &self,
        payment_id: &str,
        amount_minor: u64,
        currency: &str,
    ) -> Result<CaptureResult, GatewayError>;
}

/// Compute the hex HMAC-SHA256 the gateway uses for callback signatures.
pub fn compute_signature(payload: &str, secret: &str) -> String {
    type HmacSha256 = Hmac<Sha256>;
    // HMAC-SHA256 accepts keys of any length.
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Serialize)]
struct CreateOrderBody {
    amount: u64,
    currency: String,
    receipt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct CaptureBody {
    amount: u64,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    code: String,
    description: String,
}

/// HTTP client for the Razorpay Orders/Payments API.
#[derive(Clone)]
pub struct RazorpayClient {
    client: Client,
    config: RazorpayConfig,
}

impl RazorpayClient {
    pub fn new(config: RazorpayConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.key_id.is_empty() && !self.config.key_secret.expose_secret().is_empty()
    }

    pub fn key_id(&self) -> &str {
        &self.config.key_id
    }

    fn classify_transport_error(err: reqwest::Error) -> GatewayError {
        GatewayError::Unavailable(err.to_string())
    }

    fn parse_rejection(status: reqwest::StatusCode, body: &str) -> GatewayError {
        if status.is_server_error() {
            return GatewayError::Unavailable(format!("gateway returned {}", status));
        }
        match serde_json::from_str::<ApiError>(body) {
            Ok(api) => GatewayError::Rejected {
                code: api.error.code,
                description: api.error.description,
            },
            Err(_) => GatewayError::Rejected {
                code: "UNKNOWN".to_string(),
                description: body.to_string(),
            },
        }
    }
}

#[async_trait]
impl PaymentGateway for RazorpayClient {
    async fn create_order(
        &self,
        amount_minor: u64,
        currency: &str,
        receipt: &str,
        notes: Option<serde_json::Value>,
    ) -> Result<GatewayOrder, GatewayError> {
        if amount_minor == 0 {
            return Err(GatewayError::InvalidAmount(
                "gateway does not accept zero-amount orders".to_string(),
            ));
        }

        let body = CreateOrderBody {
            amount: amount_minor,
            currency: currency.to_string(),
            receipt: receipt.to_string(),
            notes,
        };
        let url = format!("{}/orders", self.config.api_base_url);

        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_transport_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(Self::classify_transport_error)?;

        if status.is_success() {
            let order: GatewayOrder = serde_json::from_str(&body).map_err(|e| {
                GatewayError::Unavailable(format!("malformed gateway response: {}", e))
            })?;
            tracing::info!(
                order_id = %order.id,
                amount = order.amount,
                currency = %order.currency,
                "gateway order created"
            );
            Ok(order)
        } else {
            let err = Self::parse_rejection(status, &body);
            tracing::error!(status = %status, error = %err, "gateway order creation failed");
            Err(err)
        }
    }

    fn verify_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        let payload = format!("{}|{}", order_id, payment_id);
        let expected = compute_signature(&payload, self.config.key_secret.expose_secret());
        // Exact match; anything else is a mismatch, never an error.
        expected == signature
    }

    async fn capture(
        &self,
        payment_id: &str,
        amount_minor: u64,
        currency: &str,
    ) -> Result<CaptureResult, GatewayError> {
        if amount_minor == 0 {
            return Err(GatewayError::InvalidAmount(
                "capture amount must be positive".to_string(),
            ));
        }

        let url = format!(
            "{}/payments/{}/capture",
            self.config.api_base_url, payment_id
        );
        let body = CaptureBody {
            amount: amount_minor,
            currency: currency.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_transport_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(Self::classify_transport_error)?;

        if status.is_success() {
            tracing::info!(payment_id = %payment_id, amount = amount_minor, "payment captured");
            return Ok(CaptureResult::Captured);
        }

        match Self::parse_rejection(status, &body) {
            // Idempotent from the caller's perspective: a repeat capture of a
            // settled payment is success, not an error.
            GatewayError::Rejected { ref description, .. }
                if description.to_lowercase().contains("already been captured") =>
            {
                tracing::info!(payment_id = %payment_id, "payment was already captured");
                Ok(CaptureResult::AlreadyCaptured)
            }
            err => {
                tracing::error!(payment_id = %payment_id, error = %err, "capture failed");
                Err(err)
            }
        }
    }
}

/// In-process gateway fake with real HMAC semantics and a capture counter.
pub struct MockGateway {
    secret: String,
    created: std::sync::atomic::AtomicU64,
    capture_calls: std::sync::atomic::AtomicU64,
    fail_create: std::sync::atomic::AtomicBool,
    captures_already_done: std::sync::atomic::AtomicBool,
    /// Amount the most recent create_order was called with.
    last_order_amount: std::sync::atomic::AtomicU64,
}

impl MockGateway {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
            created: std::sync::atomic::AtomicU64::new(0),
            capture_calls: std::sync::atomic::AtomicU64::new(0),
            fail_create: std::sync::atomic::AtomicBool::new(false),
            captures_already_done: std::sync::atomic::AtomicBool::new(false),
            last_order_amount: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn fail_create(&self) {
        self.fail_create
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Make subsequent captures report the gateway's "already captured" state.
    pub fn mark_already_captured(&self) {
        self.captures_already_done
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn capture_calls(&self) -> u64 {
        self.capture_calls
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn last_order_amount(&self) -> u64 {
        self.last_order_amount
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Sign a callback payload the way the real gateway would.
    pub fn sign(&self, order_id: &str, payment_id: &str) -> String {
        compute_signature(&format!("{}|{}", order_id, payment_id), &self.secret)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_order(
        &self,
        amount_minor: u64,
        currency: &str,
        receipt: &str,
        _notes: Option<serde_json::Value>,
    ) -> Result<GatewayOrder, GatewayError> {
        if self.fail_create.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("mock outage".to_string()));
        }
        if amount_minor == 0 {
            return Err(GatewayError::InvalidAmount(
                "gateway does not accept zero-amount orders".to_string(),
            ));
        }
        self.last_order_amount
            .store(amount_minor, std::sync::atomic::Ordering::SeqCst);
        let n = self
            .created
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(GatewayOrder {
            id: format!("order_mock_{}", n),
            amount: amount_minor,
            currency: currency.to_string(),
            receipt: Some(receipt.to_string()),
            status: Some("created".to_string()),
        })
    }

    fn verify_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        self.sign(order_id, payment_id) == signature
    }

    async fn capture(
        &self,
        _payment_id: &str,
        amount_minor: u64,
        _currency: &str,
    ) -> Result<CaptureResult, GatewayError> {
        if amount_minor == 0 {
            return Err(GatewayError::InvalidAmount(
                "capture amount must be positive".to_string(),
            ));
        }
        self.capture_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self
            .captures_already_done
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            Ok(CaptureResult::AlreadyCaptured)
        } else {
            Ok(CaptureResult::Captured)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str) -> RazorpayConfig {
        RazorpayConfig {
            key_id: "rzp_test_123".to_string(),
            key_secret: Secret::new("my_secret_key".to_string()),
            api_base_url: base_url.to_string(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn signature_is_deterministic_and_exact() {
        let client = RazorpayClient::new(test_config("https://api.razorpay.com/v1"));

        let valid = compute_signature("order_abc|pay_123", "my_secret_key");
        assert!(client.verify_signature("order_abc", "pay_123", &valid));
        // Same inputs, same answer.
        assert!(client.verify_signature("order_abc", "pay_123", &valid));

        // One flipped character must fail.
        let mut tampered = valid.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });
        assert!(!client.verify_signature("order_abc", "pay_123", &tampered));

        // Prefix of the real signature is not a match.
        assert!(!client.verify_signature("order_abc", "pay_123", &valid[..valid.len() - 2]));
    }

    #[tokio::test]
    async fn create_order_round_trips() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "order_abc",
                "amount": 100,
                "currency": "INR",
                "receipt": "rcpt_1",
                "status": "created"
            })))
            .mount(&server)
            .await;

        let client = RazorpayClient::new(test_config(&server.uri()));
        let order = client
            .create_order(100, "INR", "rcpt_1", None)
            .await
            .expect("order should be created");
        assert_eq!(order.id, "order_abc");
        assert_eq!(order.amount, 100);
    }

    #[tokio::test]
    async fn create_order_rejects_zero_amount_locally() {
        let client = RazorpayClient::new(test_config("http://127.0.0.1:1"));
        let err = client
            .create_order(0, "INR", "rcpt_1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidAmount(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn gateway_rejection_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "code": "BAD_REQUEST_ERROR", "description": "Currency is not supported" }
            })))
            .mount(&server)
            .await;

        let client = RazorpayClient::new(test_config(&server.uri()));
        let err = client
            .create_order(100, "XYZ", "rcpt_1", None)
            .await
            .unwrap_err();
        match err {
            GatewayError::Rejected { code, .. } => assert_eq!(code, "BAD_REQUEST_ERROR"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = RazorpayClient::new(test_config(&server.uri()));
        let err = client
            .create_order(100, "INR", "rcpt_1", None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn already_captured_surfaces_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments/pay_123/capture"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {
                    "code": "BAD_REQUEST_ERROR",
                    "description": "This payment has already been captured"
                }
            })))
            .mount(&server)
            .await;

        let client = RazorpayClient::new(test_config(&server.uri()));
        let result = client.capture("pay_123", 100, "INR").await.unwrap();
        assert_eq!(result, CaptureResult::AlreadyCaptured);
    }

    #[tokio::test]
    async fn capture_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments/pay_123/capture"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "pay_123",
                "status": "captured"
            })))
            .mount(&server)
            .await;

        let client = RazorpayClient::new(test_config(&server.uri()));
        let result = client.capture("pay_123", 100, "INR").await.unwrap();
        assert_eq!(result, CaptureResult::Captured);
    }
}
