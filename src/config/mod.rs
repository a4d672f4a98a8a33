use anyhow::Result;
use dotenvy::dotenv;
use secrecy::Secret;
use serde::Deserialize;
use std::env;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub razorpay: RazorpayConfig,
    pub smtp: SmtpConfig,
    pub download: DownloadConfig,
    pub checkout: CheckoutConfig,
    pub service_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub db_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: Secret<String>,
    pub api_base_url: String,
    /// Bound on gateway calls; past this the flow fails as gateway-unavailable.
    pub timeout_secs: u64,
}

/// SMTP settings for operator notifications (refund requests).
#[derive(Deserialize, Clone, Debug)]
pub struct SmtpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret<String>,
    pub from_email: String,
    pub from_name: String,
    /// Operator inbox that receives refund filings.
    pub operator_email: String,
}

/// Signed-URL service used to mint time-limited download links.
#[derive(Deserialize, Clone, Debug)]
pub struct DownloadConfig {
    pub endpoint: String,
    pub token_secret: Secret<String>,
    /// Served when the signed-URL service is unreachable; the grant is a
    /// convenience layer, not the sole distribution path.
    pub fallback_url: String,
    pub timeout_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct CheckoutConfig {
    pub currency: String,
    /// When the gateway is not configured for auto-capture, the orchestrator
    /// captures manually after signature verification.
    pub manual_capture: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let host = env::var("STORE_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("STORE_SERVICE_PORT")
            .unwrap_or_else(|_| "3006".to_string())
            .parse()?;

        let db_url = env::var("STORE_DATABASE_URL").expect("STORE_DATABASE_URL must be set");
        let db_name =
            env::var("STORE_DATABASE_NAME").unwrap_or_else(|_| "storefront_db".to_string());

        let razorpay = RazorpayConfig {
            key_id: env::var("RAZORPAY_KEY_ID").unwrap_or_default(),
            key_secret: Secret::new(env::var("RAZORPAY_KEY_SECRET").unwrap_or_default()),
            api_base_url: env::var("RAZORPAY_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.razorpay.com/v1".to_string()),
            timeout_secs: env::var("RAZORPAY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
        };

        let smtp = SmtpConfig {
            enabled: env::var("STORE_SMTP_ENABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            host: env::var("STORE_SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("STORE_SMTP_PORT")
                .unwrap_or_else(|_| "587".to_string())
                .parse()?,
            user: env::var("STORE_SMTP_USER").unwrap_or_default(),
            password: Secret::new(env::var("STORE_SMTP_PASSWORD").unwrap_or_default()),
            from_email: env::var("STORE_SMTP_FROM_EMAIL")
                .unwrap_or_else(|_| "noreply@yaakai.com".to_string()),
            from_name: env::var("STORE_SMTP_FROM_NAME")
                .unwrap_or_else(|_| "Yaakai Store".to_string()),
            operator_email: env::var("STORE_OPERATOR_EMAIL")
                .unwrap_or_else(|_| "support@yaakai.com".to_string()),
        };

        let download = DownloadConfig {
            endpoint: env::var("STORE_DOWNLOAD_ENDPOINT").unwrap_or_default(),
            token_secret: Secret::new(env::var("STORE_DOWNLOAD_TOKEN_SECRET").unwrap_or_default()),
            fallback_url: env::var("STORE_DOWNLOAD_FALLBACK_URL")
                .unwrap_or_else(|_| "https://downloads.yaakai.com/checkblock/latest".to_string()),
            timeout_secs: env::var("STORE_DOWNLOAD_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
        };

        let checkout = CheckoutConfig {
            currency: env::var("STORE_CURRENCY").unwrap_or_else(|_| "INR".to_string()),
            manual_capture: env::var("STORE_MANUAL_CAPTURE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
        };

        Ok(Self {
            server: ServerConfig { host, port },
            database: DatabaseConfig {
                url: Secret::new(db_url),
                db_name,
            },
            razorpay,
            smtp,
            download,
            checkout,
            service_name: "storefront-service".to_string(),
        })
    }
}
