//! Receipt documents and time-limited download grants.
//!
//! `build_receipt` is a pure function of the stored records and safe to call
//! any number of times. The download grant proves to the distribution layer
//! that this browser legitimately completed a given payment, using the same
//! HMAC construction as the gateway callback signature.

use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::DownloadConfig;
use crate::models::{Order, PaymentRecord};
use crate::services::razorpay::compute_signature;

const VENDOR_NAME: &str = "Yaakai";
const VENDOR_TAGLINE: &str = "CheckBlock Application Store";

/// Deterministic receipt derived from a payment and its fulfilled orders.
#[derive(Debug, Serialize, PartialEq)]
pub struct ReceiptDocument {
    pub invoice_number: String,
    pub vendor_name: String,
    pub vendor_tagline: String,
    pub bill_to: BillTo,
    pub payment_id: String,
    pub payment_time: String,
    pub lines: Vec<ReceiptLine>,
    /// Charged amount in minor units.
    pub amount_minor: u64,
    pub currency: String,
    pub payment_status: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct BillTo {
    pub name: String,
    pub email: String,
    pub user_id: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ReceiptLine {
    pub description: String,
    pub platform: String,
    pub quantity: u32,
}

/// Build the receipt for a payment. Pure; no side effects.
pub fn build_receipt(payment: &PaymentRecord, orders: &[Order]) -> ReceiptDocument {
    let lines = if orders.is_empty() {
        // A payment with no surviving order rows still gets a one-line
        // receipt from the payment record itself.
        vec![ReceiptLine {
            description: payment.application_name.clone(),
            platform: capitalize(&payment.product_type),
            quantity: 1,
        }]
    } else {
        orders
            .iter()
            .map(|order| ReceiptLine {
                description: order.product_name.clone(),
                platform: capitalize(&payment.product_type),
                quantity: order.quantity,
            })
            .collect()
    };

    ReceiptDocument {
        invoice_number: format!("INV-{}", payment.payment_id),
        vendor_name: VENDOR_NAME.to_string(),
        vendor_tagline: VENDOR_TAGLINE.to_string(),
        bill_to: BillTo {
            name: payment.user_name.clone(),
            email: payment.user_email.clone(),
            user_id: payment.user_id.clone(),
        },
        payment_id: payment.payment_id.clone(),
        payment_time: payment.payment_time.to_rfc3339(),
        lines,
        amount_minor: payment.amount_minor,
        currency: payment.currency.clone(),
        payment_status: "Completed".to_string(),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Product build the grant points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductVariant {
    Windows,
    Linux,
}

impl ProductVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            ProductVariant::Windows => "windows",
            ProductVariant::Linux => "linux",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DownloadGrant {
    pub url: String,
    pub filename: String,
    /// False when the signed-URL service was unreachable and the static
    /// fallback location was handed out instead.
    pub signed: bool,
}

#[derive(Debug, Serialize)]
struct GrantRequest<'a> {
    #[serde(rename = "paymentId")]
    payment_id: &'a str,
    #[serde(rename = "fileType")]
    file_type: &'a str,
    #[serde(rename = "verificationToken")]
    verification_token: String,
}

#[derive(Debug, Deserialize)]
struct GrantResponse {
    success: bool,
    #[serde(rename = "downloadUrl")]
    download_url: Option<String>,
    #[serde(rename = "fileName")]
    file_name: Option<String>,
    error: Option<String>,
}

/// Client for the external signed-URL service, with a static fallback.
#[derive(Clone)]
pub struct DownloadIssuer {
    client: Client,
    config: DownloadConfig,
}

impl DownloadIssuer {
    pub fn new(config: DownloadConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    fn fallback(&self, variant: ProductVariant) -> DownloadGrant {
        DownloadGrant {
            url: self.config.fallback_url.clone(),
            filename: format!("checkblock-{}.zip", variant.as_str()),
            signed: false,
        }
    }

    /// Mint a time-limited download link for a completed payment. Falls back
    /// to the static distribution URL when the service misbehaves; the grant
    /// is a convenience layer, not the sole distribution path.
    pub async fn issue(&self, payment_id: &str, variant: ProductVariant) -> DownloadGrant {
        if self.config.endpoint.is_empty() {
            tracing::warn!("signed-URL service not configured, using fallback download");
            return self.fallback(variant);
        }

        let token = compute_signature(payment_id, self.config.token_secret.expose_secret());
        let request = GrantRequest {
            payment_id,
            file_type: variant.as_str(),
            verification_token: token,
        };

        let response = match self
            .client
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(payment_id = %payment_id, error = %e, "signed-URL service unreachable");
                return self.fallback(variant);
            }
        };

        if !response.status().is_success() {
            tracing::warn!(
                payment_id = %payment_id,
                status = %response.status(),
                "signed-URL service returned an error"
            );
            return self.fallback(variant);
        }

        match response.json::<GrantResponse>().await {
            Ok(GrantResponse {
                success: true,
                download_url: Some(url),
                file_name,
                ..
            }) => DownloadGrant {
                url,
                filename: file_name
                    .unwrap_or_else(|| format!("checkblock-{}.zip", variant.as_str())),
                signed: true,
            },
            Ok(GrantResponse { error, .. }) => {
                tracing::warn!(
                    payment_id = %payment_id,
                    error = ?error,
                    "signed-URL service declined the grant"
                );
                self.fallback(variant)
            }
            Err(e) => {
                tracing::warn!(payment_id = %payment_id, error = %e, "malformed signed-URL response");
                self.fallback(variant)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, PaymentStatus};
    use chrono::{TimeZone, Utc};
    use secrecy::Secret;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_payment() -> PaymentRecord {
        PaymentRecord {
            id: "rec-1".to_string(),
            payment_id: "pay_123".to_string(),
            user_id: "user-1".to_string(),
            user_email: "user@example.com".to_string(),
            user_name: "Test User".to_string(),
            amount_minor: 100,
            currency: "INR".to_string(),
            product_type: "windows".to_string(),
            application_name: "CheckBlock".to_string(),
            payment_time: Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap(),
            status: PaymentStatus::Completed,
        }
    }

    fn sample_order() -> Order {
        Order {
            id: "ord-1".to_string(),
            user_id: "user-1".to_string(),
            product_id: "checkblock-windows".to_string(),
            product_name: "CheckBlock for Windows".to_string(),
            quantity: 1,
            purchase_date: Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap(),
            status: OrderStatus::Completed,
            transaction_id: Some("pay_123".to_string()),
        }
    }

    fn download_config(endpoint: &str) -> DownloadConfig {
        DownloadConfig {
            endpoint: endpoint.to_string(),
            token_secret: Secret::new("download_secret".to_string()),
            fallback_url: "https://downloads.example.com/checkblock/latest".to_string(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn receipt_is_deterministic() {
        let payment = sample_payment();
        let orders = vec![sample_order()];

        let first = build_receipt(&payment, &orders);
        let second = build_receipt(&payment, &orders);
        assert_eq!(first, second);

        assert_eq!(first.invoice_number, "INV-pay_123");
        assert_eq!(first.lines.len(), 1);
        assert_eq!(first.lines[0].platform, "Windows");
        assert_eq!(first.amount_minor, 100);
    }

    #[test]
    fn receipt_without_order_rows_uses_the_payment_record() {
        let payment = sample_payment();
        let receipt = build_receipt(&payment, &[]);
        assert_eq!(receipt.lines.len(), 1);
        assert_eq!(receipt.lines[0].description, "CheckBlock");
    }

    #[tokio::test]
    async fn grant_comes_from_the_signed_url_service() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "downloadUrl": "https://signed.example.com/abc123",
                "fileName": "checkblock-setup.exe"
            })))
            .mount(&server)
            .await;

        let issuer = DownloadIssuer::new(download_config(&server.uri()));
        let grant = issuer.issue("pay_123", ProductVariant::Windows).await;

        assert!(grant.signed);
        assert_eq!(grant.url, "https://signed.example.com/abc123");
        assert_eq!(grant.filename, "checkblock-setup.exe");
    }

    #[tokio::test]
    async fn service_failure_falls_back_to_the_static_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let issuer = DownloadIssuer::new(download_config(&server.uri()));
        let grant = issuer.issue("pay_123", ProductVariant::Linux).await;

        assert!(!grant.signed);
        assert_eq!(grant.url, "https://downloads.example.com/checkblock/latest");
        assert_eq!(grant.filename, "checkblock-linux.zip");
    }

    #[tokio::test]
    async fn declined_grant_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "error": "payment not found"
            })))
            .mount(&server)
            .await;

        let issuer = DownloadIssuer::new(download_config(&server.uri()));
        let grant = issuer.issue("pay_999", ProductVariant::Windows).await;
        assert!(!grant.signed);
    }
}
