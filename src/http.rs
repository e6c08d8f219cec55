//! HTTP surface: webhook intake, classification triggers, lifecycle and
//! retention sweeps, OAuth connect, reply sending, and admin operations.
//!
//! Handlers stay thin — they authenticate, decode, delegate to the module
//! that owns the behavior, and map errors to status codes. The Meta webhook
//! endpoints are the exception to normal error mapping: the provider
//! disables subscriptions that error repeatedly, so delivery handling
//! swallows everything and acks.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::classify::{self, BatchSettings};
use crate::crypto;
use crate::error::TriageError;
use crate::lifecycle::{self, SweepSettings};
use crate::retention;
use crate::state::AppState;
use crate::webhook::{self, WebhookPayload};

/// Days of access granted by one approved payment.
const SUBSCRIPTION_PERIOD_DAYS: i64 = 30;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/webhooks/instagram",
            get(verify_webhook).post(receive_webhook),
        )
        .route("/webhooks/payment", post(payment_webhook))
        .route("/classify", post(classify_one))
        .route("/classify/batch", post(classify_batch))
        .route("/subscriptions/sweep", post(subscription_sweep))
        .route("/retention/sweep", post(retention_sweep))
        .route("/messages/send", post(send_reply))
        .route("/oauth/instagram/url", get(oauth_url))
        .route("/oauth/instagram/exchange", post(oauth_exchange))
        .route("/admin/migrate-tokens", post(migrate_tokens))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Handler-level error: a `TriageError` mapped onto a status code and a
/// `{ "error": ... }` body.
struct ApiError(TriageError);

impl From<TriageError> for ApiError {
    fn from(err: TriageError) -> Self {
        Self(err)
    }
}

impl From<crate::crypto::CryptoError> for ApiError {
    fn from(err: crate::crypto::CryptoError) -> Self {
        Self(TriageError::Crypto(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TriageError::Unauthorized => StatusCode::UNAUTHORIZED,
            TriageError::NotFound(_) => StatusCode::NOT_FOUND,
            TriageError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            TriageError::LlmApi { .. }
            | TriageError::ProviderApi { .. }
            | TriageError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// Meta webhook
// ---------------------------------------------------------------------------

/// Subscription verification handshake: echo the challenge iff the mode is
/// `subscribe` and the shared token matches.
async fn verify_webhook(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match verification_challenge(&params, &state.config.webhook_verify_token) {
        Some(challenge) => {
            info!("webhook verification succeeded");
            (StatusCode::OK, challenge).into_response()
        }
        None => {
            warn!("webhook verification rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

fn verification_challenge(
    params: &HashMap<String, String>,
    expected_token: &str,
) -> Option<String> {
    let mode = params.get("hub.mode")?;
    let token = params.get("hub.verify_token")?;
    let challenge = params.get("hub.challenge")?;
    (mode == "subscribe" && token == expected_token).then(|| challenge.clone())
}

/// Message delivery. Always acks — Meta disables webhooks that keep failing,
/// and a dropped delivery is recoverable while a disabled subscription is
/// not.
async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let payload: WebhookPayload = match serde_json::from_value(body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "unparseable webhook delivery");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "invalid payload" })),
            )
                .into_response();
        }
    };

    let outcome = webhook::process_delivery(&state, payload).await;
    info!(
        inserted = outcome.inserted,
        skipped = outcome.skipped,
        "webhook delivery processed"
    );
    (StatusCode::OK, Json(json!({ "received": true }))).into_response()
}

// ---------------------------------------------------------------------------
// Classification triggers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyOneRequest {
    message_id: String,
}

async fn classify_one(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ClassifyOneRequest>,
) -> Result<Json<crate::types::ClassificationResult>, ApiError> {
    let result = classify::classify_message(
        &state.db,
        state.classifier.as_ref(),
        &request.message_id,
    )
    .await?;
    Ok(Json(result))
}

async fn classify_batch(
    State(state): State<Arc<AppState>>,
) -> Result<Json<classify::BatchSummary>, ApiError> {
    let settings = BatchSettings {
        window_minutes: state.config.batch_window_minutes,
        limit: state.config.batch_limit,
        lease_minutes: state.config.processing_lease_minutes,
    };
    let summary = classify::classify_batch(&state.db, state.classifier.as_ref(), &settings).await?;
    Ok(Json(summary))
}

// ---------------------------------------------------------------------------
// Sweeps
// ---------------------------------------------------------------------------

async fn subscription_sweep(
    State(state): State<Arc<AppState>>,
) -> Json<lifecycle::SweepSummary> {
    let settings = SweepSettings {
        grace_period_days: state.config.grace_period_days,
        deletion_after_days: state.config.deletion_after_days,
    };
    Json(lifecycle::run_sweep(&state.db, &settings))
}

async fn retention_sweep(
    State(state): State<Arc<AppState>>,
) -> Result<Json<retention::RetentionSummary>, ApiError> {
    let summary = retention::run_retention_sweep(&state.db, state.config.retention_days)?;
    Ok(Json(summary))
}

// ---------------------------------------------------------------------------
// Reply sending
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendReplyRequest {
    recipient_id: String,
    message: String,
    /// Triage message being answered; marked read after a successful send.
    #[serde(default)]
    message_id: Option<String>,
}

async fn send_reply(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SendReplyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Resolve the caller and their Instagram credentials under one lock
    let (access_token, instagram_id) = {
        let guard = state.db.lock();
        sender_credentials(&guard, &state.cipher, bearer_token(&headers))?
    };

    let provider_message_id = state
        .instagram
        .send_message(
            &access_token,
            &instagram_id,
            &request.recipient_id,
            &request.message,
        )
        .await?;

    if let Some(message_id) = &request.message_id {
        state.db.lock().mark_read(message_id)?;
    }

    Ok(Json(json!({ "success": true, "messageId": provider_message_id })))
}

/// Map a bearer token onto the caller's Instagram credentials: unknown or
/// missing tokens are an auth failure, a profile without a connected
/// account is a caller error, and a token flagged encrypted is decrypted
/// before use.
fn sender_credentials(
    db: &crate::db::TriageDb,
    cipher: &crate::crypto::TokenCipher,
    bearer: Option<&str>,
) -> Result<(String, String), TriageError> {
    let token = bearer.ok_or(TriageError::Unauthorized)?;
    let profile = db
        .find_profile_by_api_token(token)?
        .ok_or(TriageError::Unauthorized)?;

    let stored = profile
        .instagram_access_token
        .ok_or_else(|| TriageError::InvalidRequest("no Instagram account connected".to_string()))?;
    let access_token = if profile.token_encrypted {
        cipher.decrypt(&stored)?
    } else {
        stored
    };
    let instagram_id = profile
        .instagram_id
        .ok_or_else(|| TriageError::InvalidRequest("no Instagram account connected".to_string()))?;
    Ok((access_token, instagram_id))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

// ---------------------------------------------------------------------------
// OAuth connect
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthUrlQuery {
    redirect_uri: String,
}

async fn oauth_url(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OAuthUrlQuery>,
) -> Json<serde_json::Value> {
    Json(json!({ "url": state.instagram.authorize_url(&query.redirect_uri) }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthExchangeRequest {
    code: String,
    redirect_uri: String,
    user_id: String,
}

/// Complete the Instagram connect flow: exchange the code, verify the
/// account is professional, store the encrypted token, and create (or
/// refresh) the workspace mapped to the page.
async fn oauth_exchange(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OAuthExchangeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account = state
        .instagram
        .exchange_code(&request.code, &request.redirect_uri)
        .await?;

    let encrypted = state.cipher.encrypt(&account.access_token)?;

    {
        let guard = state.db.lock();
        guard.upsert_instagram_identity(
            &request.user_id,
            &account.instagram_id,
            &account.username,
            &encrypted,
        )?;
        guard.upsert_workspace(
            &request.user_id,
            &format!("@{}", account.username),
            &account.instagram_id,
        )?;
    }

    info!(user_id = %request.user_id, username = %account.username, "instagram account connected");
    Ok(Json(json!({
        "success": true,
        "instagramId": account.instagram_id,
        "username": account.username,
    })))
}

// ---------------------------------------------------------------------------
// Payment webhook
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentNotification {
    user_id: String,
    status: String,
    #[serde(default)]
    payment_id: Option<String>,
    #[serde(default)]
    payment_method: Option<String>,
    #[serde(default)]
    amount: Option<f64>,
    #[serde(default)]
    currency: Option<String>,
}

/// Payment processor callback. Approved payments reactivate the
/// subscription with a fresh period; everything else is acknowledged and
/// ignored. Always 200 — processors retry on errors and the operation is
/// idempotent anyway.
async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let notification: PaymentNotification = match serde_json::from_value(body) {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "unparseable payment notification");
            return Json(json!({ "received": true }));
        }
    };

    if notification.status != "approved" {
        info!(
            user_id = %notification.user_id,
            status = %notification.status,
            "payment notification ignored"
        );
        return Json(json!({ "received": true }));
    }

    let now = Utc::now();
    let result = state.db.lock().reactivate_subscription(
        &notification.user_id,
        notification.payment_id.as_deref(),
        notification.payment_method.as_deref(),
        notification.amount,
        notification.currency.as_deref(),
        now,
        now + Duration::days(SUBSCRIPTION_PERIOD_DAYS),
    );

    match result {
        Ok(()) => info!(user_id = %notification.user_id, "subscription reactivated"),
        Err(e) => warn!(user_id = %notification.user_id, error = %e, "reactivation failed"),
    }
    Json(json!({ "received": true }))
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

async fn migrate_tokens(
    State(state): State<Arc<AppState>>,
) -> Json<crypto::MigrationReport> {
    let report = {
        let guard = state.db.lock();
        crypto::migrate_profile_tokens(&guard, &state.cipher)
    };
    Json(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_verification_accepts_matching_subscribe() {
        let p = params(&[
            ("hub.mode", "subscribe"),
            ("hub.verify_token", "verify-me"),
            ("hub.challenge", "123456"),
        ]);
        assert_eq!(
            verification_challenge(&p, "verify-me"),
            Some("123456".to_string())
        );
    }

    #[test]
    fn test_verification_rejects_bad_token_or_mode() {
        let wrong_token = params(&[
            ("hub.mode", "subscribe"),
            ("hub.verify_token", "guess"),
            ("hub.challenge", "123456"),
        ]);
        assert_eq!(verification_challenge(&wrong_token, "verify-me"), None);

        let wrong_mode = params(&[
            ("hub.mode", "unsubscribe"),
            ("hub.verify_token", "verify-me"),
            ("hub.challenge", "123456"),
        ]);
        assert_eq!(verification_challenge(&wrong_mode, "verify-me"), None);

        let missing = params(&[("hub.mode", "subscribe")]);
        assert_eq!(verification_challenge(&missing, "verify-me"), None);
    }

    #[test]
    fn test_sender_credentials_rejects_unknown_bearer() {
        let db = crate::db::TriageDb::open_in_memory().unwrap();
        let cipher = crate::crypto::TokenCipher::new(&[7u8; 32]);

        let missing = sender_credentials(&db, &cipher, None).unwrap_err();
        assert!(matches!(missing, TriageError::Unauthorized));

        let unknown = sender_credentials(&db, &cipher, Some("not-a-token")).unwrap_err();
        assert!(matches!(unknown, TriageError::Unauthorized));
    }

    #[test]
    fn test_sender_credentials_requires_connected_account() {
        let db = crate::db::TriageDb::open_in_memory().unwrap();
        let cipher = crate::crypto::TokenCipher::new(&[7u8; 32]);

        // Valid bearer, but no Instagram token stored
        db.insert_profile_with_token("user-1", None, false).unwrap();
        db.set_test_identity("user-1", "ig-1", "bearer-1").unwrap();

        let err = sender_credentials(&db, &cipher, Some("bearer-1")).unwrap_err();
        assert!(matches!(err, TriageError::InvalidRequest(_)));
    }

    #[test]
    fn test_sender_credentials_decrypts_flagged_token() {
        let db = crate::db::TriageDb::open_in_memory().unwrap();
        let cipher = crate::crypto::TokenCipher::new(&[7u8; 32]);

        let encrypted = cipher.encrypt("IGQVJ-live-token").unwrap();
        db.insert_profile_with_token("user-1", Some(&encrypted), true)
            .unwrap();
        db.set_test_identity("user-1", "ig-1", "bearer-1").unwrap();

        let (access_token, instagram_id) =
            sender_credentials(&db, &cipher, Some("bearer-1")).unwrap();
        assert_eq!(access_token, "IGQVJ-live-token");
        assert_eq!(instagram_id, "ig-1");
    }

    #[test]
    fn test_sender_credentials_passes_unflagged_token_through() {
        let db = crate::db::TriageDb::open_in_memory().unwrap();
        let cipher = crate::crypto::TokenCipher::new(&[7u8; 32]);

        // Legacy row from before the token migration
        db.insert_profile_with_token("user-1", Some("plaintext-token"), false)
            .unwrap();
        db.set_test_identity("user-1", "ig-1", "bearer-1").unwrap();

        let (access_token, _) = sender_credentials(&db, &cipher, Some("bearer-1")).unwrap();
        assert_eq!(access_token, "plaintext-token");
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc-123".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), Some("abc-123"));

        let mut basic = HeaderMap::new();
        basic.insert(
            axum::http::header::AUTHORIZATION,
            "Basic dXNlcg==".parse().unwrap(),
        );
        assert_eq!(bearer_token(&basic), None);

        let mut empty = HeaderMap::new();
        empty.insert(axum::http::header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(bearer_token(&empty), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
