//! Authenticated-user context.
//!
//! Identity is delegated to the external provider behind the web layer; by
//! the time a request reaches this service the user has been resolved and is
//! carried in headers. The core only needs a stable id and an email.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
}

impl UserContext {
    pub fn new(user_id: String, email: String, name: Option<String>) -> Self {
        Self {
            user_id,
            email,
            name,
        }
    }

    /// Name for receipts and notifications; falls back to the email.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.email)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for UserContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("X-User-Id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::AuthError("Missing X-User-Id header".to_string()))?;

        let email = parts
            .headers
            .get("X-User-Email")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::AuthError("Missing X-User-Email header".to_string()))?;

        let name = parts
            .headers
            .get("X-User-Name")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Ok(UserContext::new(
            user_id.to_string(),
            email.to_string(),
            name,
        ))
    }
}
