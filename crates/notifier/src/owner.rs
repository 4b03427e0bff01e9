//! HTTP client for the owning service.
//!
//! Three endpoints are used:
//! - `POST {base}/api/v1/notifications/status`: terminal status reports
//! - `PUT  {base}/api/v1/users/push-token`: clear a stale device token
//! - `GET  {base}/api/v1/users/{user_id}`: resolve the user's device token

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use herald_common::error::AppError;
use herald_common::types::{StatusReport, TokenInvalidation};
use herald_engine::StatusSink;

/// Resolves a user's current push token.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// `Ok(None)` when the user is unknown or has no registered device.
    async fn resolve(&self, user_id: &str) -> Result<Option<String>, AppError>;
}

/// Response envelope used by the owning service.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserRecord {
    push_token: Option<String>,
}

/// Client for the owning service's status and user endpoints.
#[derive(Clone)]
pub struct OwnerServiceClient {
    http: reqwest::Client,
    base_url: Url,
}

impl OwnerServiceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("invalid owner service URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "owner service URL '{}' cannot carry a path",
                base_url
            )));
        }
        Ok(Self { http, base_url })
    }

    /// Append path segments to the base URL. Each segment is percent-encoded,
    /// so `/`, `?` and `#` inside a value never change the target resource.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[async_trait]
impl StatusSink for OwnerServiceClient {
    async fn send_status(&self, report: &StatusReport) -> Result<(), AppError> {
        self.http
            .post(self.url(&["api", "v1", "notifications", "status"]))
            .json(report)
            .send()
            .await?
            .error_for_status()?;

        tracing::debug!(
            request_id = %report.request_id,
            status = %report.status,
            "Status reported to owning service"
        );
        Ok(())
    }

    async fn invalidate_token(&self, invalidation: &TokenInvalidation) -> Result<(), AppError> {
        self.http
            .put(self.url(&["api", "v1", "users", "push-token"]))
            .json(invalidation)
            .send()
            .await?
            .error_for_status()?;

        tracing::info!(user_id = %invalidation.user_id, "Device token invalidated");
        Ok(())
    }
}

#[async_trait]
impl DeviceDirectory for OwnerServiceClient {
    async fn resolve(&self, user_id: &str) -> Result<Option<String>, AppError> {
        // Dot segments are dropped by URL normalization rather than encoded.
        if matches!(user_id.trim(), "" | "." | "..") {
            tracing::info!(user_id, "Refusing to look up unaddressable user id");
            return Ok(None);
        }

        let response = self
            .http
            .get(self.url(&["api", "v1", "users", user_id]))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::info!(user_id, "User not found in owning service");
            return Ok(None);
        }

        let envelope: Envelope<UserRecord> = response.error_for_status()?.json().await?;
        if !envelope.success {
            tracing::info!(
                user_id,
                error = envelope.error.as_deref().unwrap_or("unknown"),
                "Owning service refused user lookup"
            );
            return Ok(None);
        }

        Ok(envelope
            .data
            .and_then(|user| user.push_token)
            .filter(|token| !token.trim().is_empty()))
    }
}
