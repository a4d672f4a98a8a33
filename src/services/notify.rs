//! Operator notifications for refund filings.
//!
//! Notification is best-effort by design: the user-facing guarantee ("your
//! refund request was received") is the persisted state change, never the
//! email. Callers log send failures and move on.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use secrecy::ExposeSecret;
use thiserror::Error;

use crate::config::SmtpConfig;
use crate::models::RefundRequest;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifications disabled: {0}")]
    NotEnabled(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Details forwarded to the operator channel alongside the stored request.
#[derive(Debug, Clone)]
pub struct RefundNotice {
    pub order_id: String,
    pub user_id: String,
    pub user_email: String,
    pub user_name: String,
    pub reason: String,
    pub issue_description: String,
}

impl RefundNotice {
    pub fn from_request(request: &RefundRequest, user_email: &str, user_name: &str) -> Self {
        Self {
            order_id: request.order_id.clone(),
            user_id: request.user_id.clone(),
            user_email: user_email.to_string(),
            user_name: user_name.to_string(),
            reason: request.reason.clone(),
            issue_description: request.issue_description.clone(),
        }
    }
}

#[async_trait]
pub trait RefundNotifier: Send + Sync {
    async fn send_refund_notice(&self, notice: &RefundNotice) -> Result<(), NotifyError>;
}

/// SMTP-backed notifier for the operator inbox.
pub struct SmtpNotifier {
    config: SmtpConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Result<Self, NotifyError> {
        if !config.enabled {
            return Ok(Self {
                config,
                transport: None,
            });
        }

        let creds = Credentials::new(
            config.user.clone(),
            config.password.expose_secret().clone(),
        );
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| {
                NotifyError::Configuration(format!("failed to create SMTP relay: {}", e))
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            config,
            transport: Some(transport),
        })
    }

    fn render_body(notice: &RefundNotice) -> String {
        format!(
            "<div>\
             <h1>New Refund Request</h1>\
             <p><strong>Order ID:</strong> {}</p>\
             <p><strong>User ID:</strong> {}</p>\
             <p><strong>User Name:</strong> {}</p>\
             <p><strong>User Email:</strong> {}</p>\
             <p><strong>Reason for Refund:</strong></p>\
             <p>{}</p>\
             <p><strong>Issue Description:</strong></p>\
             <p>{}</p>\
             </div>",
            notice.order_id,
            notice.user_id,
            notice.user_name,
            notice.user_email,
            notice.reason.replace('\n', "<br>"),
            notice.issue_description.replace('\n', "<br>"),
        )
    }
}

#[async_trait]
impl RefundNotifier for SmtpNotifier {
    async fn send_refund_notice(&self, notice: &RefundNotice) -> Result<(), NotifyError> {
        if !self.config.enabled {
            return Err(NotifyError::NotEnabled(
                "SMTP notifier is not enabled".to_string(),
            ));
        }
        let transport = self.transport.as_ref().ok_or_else(|| {
            NotifyError::Configuration("SMTP transport not initialized".to_string())
        })?;

        let from: Mailbox = format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(|e| NotifyError::Configuration(format!("invalid from address: {}", e)))?;
        let to: Mailbox = self
            .config
            .operator_email
            .parse()
            .map_err(|e| NotifyError::Configuration(format!("invalid operator address: {}", e)))?;

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(format!("Refund Request - Order ID: {}", notice.order_id));

        // Reply-to the requester so the operator can answer directly.
        if let Ok(reply_to) = notice.user_email.parse::<Mailbox>() {
            builder = builder.reply_to(reply_to);
        }

        let message = builder
            .header(ContentType::TEXT_HTML)
            .body(Self::render_body(notice))
            .map_err(|e| NotifyError::SendFailed(format!("failed to build message: {}", e)))?;

        transport
            .send(message)
            .await
            .map_err(|e| NotifyError::SendFailed(format!("failed to send email: {}", e)))?;

        tracing::info!(
            order_id = %notice.order_id,
            to = %self.config.operator_email,
            "refund notice sent"
        );
        Ok(())
    }
}

/// Counting notifier for tests, with failure injection.
#[derive(Default)]
pub struct MockNotifier {
    sent: std::sync::atomic::AtomicU64,
    fail_sends: std::sync::atomic::AtomicBool,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_sends(&self) {
        self.fail_sends
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl RefundNotifier for MockNotifier {
    async fn send_refund_notice(&self, notice: &RefundNotice) -> Result<(), NotifyError> {
        if self.fail_sends.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(NotifyError::SendFailed("injected send failure".to_string()));
        }
        self.sent.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        tracing::info!(order_id = %notice.order_id, "[MOCK] refund notice would be sent");
        Ok(())
    }
}
