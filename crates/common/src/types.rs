use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Delivery channel requested by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Email,
    Push,
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::Email => write!(f, "email"),
            NotificationType::Push => write!(f, "push"),
        }
    }
}

/// Terminal status reported to the owning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Raw message as published on the push queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub notification_type: NotificationType,
    pub user_id: String,
    pub template_code: String,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    pub request_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl QueueMessage {
    /// Parse a queue payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, AppError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Build the pipeline request once the device token has been resolved.
    ///
    /// Non-string variables are flattened to their JSON text.
    pub fn into_request(self, device_token: Option<String>) -> NotificationRequest {
        let variables = self
            .variables
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, text)
            })
            .collect();

        NotificationRequest {
            request_id: self.request_id,
            user_id: self.user_id,
            device_token,
            notification_type: self.notification_type,
            template_code: self.template_code,
            priority: self.priority,
            variables,
        }
    }
}

/// A single push delivery request. Immutable once dequeued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub request_id: String,
    pub user_id: String,
    pub device_token: Option<String>,
    pub notification_type: NotificationType,
    pub template_code: String,
    pub priority: i32,
    pub variables: HashMap<String, String>,
}

impl NotificationRequest {
    /// Basic shape validation. Device token presence is checked separately.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.request_id.trim().is_empty() {
            return Err(AppError::Validation("request_id is empty".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(AppError::Validation("user_id is empty".to_string()));
        }
        if self.template_code.trim().is_empty() {
            return Err(AppError::Validation("template_code is empty".to_string()));
        }
        if self.notification_type != NotificationType::Push {
            return Err(AppError::Validation(format!(
                "unsupported notification_type '{}'",
                self.notification_type
            )));
        }
        Ok(())
    }

    /// The resolved device token, if it is present and non-blank.
    pub fn device_token(&self) -> Option<&str> {
        self.device_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    /// Push payload built from the request variables.
    pub fn content(&self) -> NotificationContent {
        NotificationContent {
            title: self
                .variables
                .get("title")
                .cloned()
                .unwrap_or_else(|| self.template_code.clone()),
            body: self.variables.get("body").cloned().unwrap_or_default(),
            image: self.variables.get("image").cloned(),
        }
    }
}

/// Human-readable push payload ready for the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    pub image: Option<String>,
}

/// Terminal delivery report sent to the owning service's status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(rename = "notification_id")]
    pub request_id: String,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "error")]
    pub error_detail: Option<String>,
}

impl StatusReport {
    pub fn delivered(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: DeliveryStatus::Delivered,
            timestamp: Utc::now(),
            error_detail: None,
        }
    }

    pub fn failed(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: DeliveryStatus::Failed,
            timestamp: Utc::now(),
            error_detail: Some(error.into()),
        }
    }
}

/// Body of the user-update call that clears a stale device token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInvalidation {
    pub user_id: String,
    pub token: Option<String>,
}

impl TokenInvalidation {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: None,
        }
    }
}

/// Entry written to the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_message: String,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
}
