//! Firebase Cloud Messaging gateway (HTTP v1 API).
//!
//! Authenticates with an OAuth2 access token obtained through the JWT-bearer
//! grant, signed with the service-account key and cached until shortly before
//! it expires.
//!
//! Error classification:
//! - `UNREGISTERED`, `SENDER_ID_MISMATCH`, bare HTTP 404 → permanent
//!   rejection, device token cleared
//! - `INVALID_ARGUMENT` → permanent rejection of the message only; the token
//!   is kept since the fault may be in the payload
//! - `UNAVAILABLE`, `INTERNAL`, `QUOTA_EXCEEDED`, 429, 5xx, network errors,
//!   deadline expiry, token grant failures → transient
//! - anything unrecognised → transient

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::types::NotificationContent;
use herald_engine::{DeliveryOutcome, GatewayClient};

const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const FCM_BASE_URL: &str = "https://fcm.googleapis.com";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Refresh the access token this long before the provider says it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Error codes meaning the device token will never work again.
const DEAD_TOKEN_ERROR_CODES: &[&str] = &["UNREGISTERED", "SENDER_ID_MISMATCH"];

/// Error codes rejecting the message itself.
const REJECTED_PAYLOAD_ERROR_CODES: &[&str] = &["INVALID_ARGUMENT"];

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Google service-account credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccount {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccount {
    /// Decode a base64-encoded service-account JSON document.
    pub fn from_base64(encoded: &str) -> Result<Self, AppError> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AppError::Config(format!("FIREBASE_CONFIG is not valid base64: {}", e)))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn from_file(path: &str) -> Result<Self, AppError> {
        let raw = std::fs::read(path)
            .map_err(|e| AppError::Config(format!("cannot read {}: {}", path, e)))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Load from `FIREBASE_CONFIG`, falling back to `FIREBASE_CONFIG_PATH`.
    pub fn load(config: &AppConfig) -> Result<Self, AppError> {
        match (&config.firebase_config, &config.firebase_config_path) {
            (Some(encoded), _) => Self::from_base64(encoded),
            (None, Some(path)) => Self::from_file(path),
            (None, None) => Err(AppError::Config(
                "no Firebase credentials configured".to_string(),
            )),
        }
    }
}

#[derive(Debug, Serialize)]
struct GrantClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct AccessToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct FcmErrorBody {
    error: FcmErrorStatus,
}

#[derive(Debug, Deserialize)]
struct FcmErrorStatus {
    #[serde(default)]
    message: String,
    status: Option<String>,
    #[serde(default)]
    details: Vec<FcmErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct FcmErrorDetail {
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
}

/// FCM HTTP v1 client.
pub struct FcmGateway {
    http: reqwest::Client,
    account: ServiceAccount,
    signing_key: EncodingKey,
    send_url: String,
    token: Mutex<Option<AccessToken>>,
}

impl FcmGateway {
    /// `timeout` is the deadline of a single provider call.
    pub fn new(account: ServiceAccount, timeout: Duration) -> Result<Self, AppError> {
        Self::with_base_url(account, timeout, FCM_BASE_URL)
    }

    /// Point the client at a different FCM host (emulators, tests).
    pub fn with_base_url(
        account: ServiceAccount,
        timeout: Duration,
        base_url: &str,
    ) -> Result<Self, AppError> {
        let signing_key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(|e| AppError::Config(format!("invalid service-account key: {}", e)))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let send_url = format!(
            "{}/v1/projects/{}/messages:send",
            base_url.trim_end_matches('/'),
            account.project_id
        );

        Ok(Self {
            http,
            account,
            signing_key,
            send_url,
            token: Mutex::new(None),
        })
    }

    /// Cached access token, refreshed through the JWT-bearer grant if stale.
    async fn access_token(&self) -> Result<String, AppError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.value.clone());
        }

        let now = Utc::now().timestamp();
        let claims = GrantClaims {
            iss: &self.account.client_email,
            scope: FCM_SCOPE,
            aud: &self.account.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.account.private_key_id.clone();
        let assertion = jsonwebtoken::encode(&header, &claims, &self.signing_key)
            .map_err(|e| AppError::Auth(format!("failed to sign token grant: {}", e)))?;

        let response: TokenResponse = self
            .http
            .post(&self.account.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        tracing::debug!(
            lifetime_secs = lifetime.as_secs(),
            "Obtained FCM access token"
        );
        let value = response.access_token.clone();
        *cached = Some(AccessToken {
            value: response.access_token,
            refresh_at: Instant::now() + lifetime,
        });
        Ok(value)
    }

    async fn forget_token(&self) {
        *self.token.lock().await = None;
    }

    fn message_body(device_token: &str, content: &NotificationContent) -> serde_json::Value {
        let mut notification = json!({
            "title": content.title,
            "body": content.body,
        });
        if let Some(image) = &content.image {
            notification["image"] = json!(image);
        }
        json!({
            "message": {
                "token": device_token,
                "notification": notification,
            }
        })
    }
}

/// Map an FCM HTTP response to a delivery outcome.
pub fn classify_response(status: StatusCode, body: &str) -> DeliveryOutcome {
    if status.is_success() {
        return DeliveryOutcome::Delivered;
    }

    let parsed = serde_json::from_str::<FcmErrorBody>(body).ok();
    let error_code = parsed.as_ref().and_then(|b| {
        b.error
            .details
            .iter()
            .find_map(|d| d.error_code.clone())
            .or_else(|| b.error.status.clone())
    });
    let message = parsed
        .as_ref()
        .map(|b| b.error.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| status.to_string());

    if let Some(code) = error_code {
        if DEAD_TOKEN_ERROR_CODES.contains(&code.as_str()) {
            return DeliveryOutcome::permanent(code);
        }
        if REJECTED_PAYLOAD_ERROR_CODES.contains(&code.as_str()) {
            return DeliveryOutcome::rejected_payload(code);
        }
        return DeliveryOutcome::transient(format!("{}: {}", code, message));
    }

    if status == StatusCode::NOT_FOUND {
        return DeliveryOutcome::permanent("UNREGISTERED");
    }
    DeliveryOutcome::transient(format!("HTTP {}: {}", status.as_u16(), message))
}

/// Map a transport-level error to a delivery outcome. Always transient.
pub fn classify_transport(err: &reqwest::Error) -> DeliveryOutcome {
    if err.is_timeout() {
        DeliveryOutcome::transient("FCM deadline exceeded")
    } else if err.is_connect() {
        DeliveryOutcome::transient(format!("FCM unreachable: {}", err))
    } else {
        DeliveryOutcome::transient(format!("FCM transport error: {}", err))
    }
}

#[async_trait]
impl GatewayClient for FcmGateway {
    fn name(&self) -> &'static str {
        "fcm"
    }

    async fn send(&self, device_token: &str, content: &NotificationContent) -> DeliveryOutcome {
        let access_token = match self.access_token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "FCM token grant failed");
                return DeliveryOutcome::transient(format!("auth: {}", e));
            }
        };

        let response = match self
            .http
            .post(&self.send_url)
            .bearer_auth(access_token)
            .json(&Self::message_body(device_token, content))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return classify_transport(&e),
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.forget_token().await;
        }
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return classify_transport(&e),
        };

        let outcome = classify_response(status, &body);
        if !matches!(outcome, DeliveryOutcome::Delivered) {
            tracing::debug!(status = status.as_u16(), outcome = ?outcome, "FCM send failed");
        }
        outcome
    }
}
