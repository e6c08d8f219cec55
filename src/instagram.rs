//! Instagram Graph API client: OAuth code exchange, sender profile lookup,
//! and the send API.
//!
//! Transient upstream failures (408/429/5xx, transport timeouts) are retried
//! with exponential backoff honoring Retry-After; anything else surfaces as
//! a `ProviderApi` error carrying the provider's message.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::TriageError;

const OAUTH_AUTHORIZE_URL: &str = "https://api.instagram.com/oauth/authorize";
const OAUTH_TOKEN_URL: &str = "https://api.instagram.com/oauth/access_token";
const GRAPH_URL: &str = "https://graph.instagram.com";
const SEND_API_VERSION: &str = "v24.0";

/// Business-messaging scopes for the Instagram Login flow.
const OAUTH_SCOPES: &[&str] = &[
    "instagram_business_basic",
    "instagram_business_manage_messages",
    "instagram_business_manage_comments",
];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

/// Display profile fields fetched for sender enrichment. All optional —
/// enrichment failure stores nulls, never blocks intake.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SenderProfile {
    pub name: Option<String>,
    pub username: Option<String>,
    #[serde(rename = "followers_count")]
    pub follower_count: Option<i64>,
    #[serde(rename = "profile_picture_url")]
    pub avatar_url: Option<String>,
}

/// Result of exchanging an OAuth code: the short-lived token plus the
/// verified profile behind it.
#[derive(Debug, Clone)]
pub struct ConnectedAccount {
    pub access_token: String,
    pub instagram_id: String,
    pub username: String,
}

pub struct InstagramClient {
    http: reqwest::Client,
    app_id: String,
    app_secret: String,
    retry: RetryPolicy,
}

impl InstagramClient {
    pub fn new(
        app_id: String,
        app_secret: String,
        timeout: Duration,
    ) -> Result<Self, TriageError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            app_id,
            app_secret,
            retry: RetryPolicy::default(),
        })
    }

    /// Build the authorize URL the dashboard redirects the creator to.
    pub fn authorize_url(&self, redirect_uri: &str) -> String {
        format!(
            "{OAUTH_AUTHORIZE_URL}?client_id={}&redirect_uri={}&response_type=code&scope={}",
            self.app_id,
            urlencode(redirect_uri),
            urlencode(&OAUTH_SCOPES.join(","))
        )
    }

    /// Exchange an OAuth code for a token and verify the account is a
    /// professional (business/creator) one.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ConnectedAccount, TriageError> {
        let form = [
            ("client_id", self.app_id.as_str()),
            ("client_secret", self.app_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
            ("code", code),
        ];

        let response = self.http.post(OAUTH_TOKEN_URL).form(&form).send().await?;
        let status = response.status();
        let exchange: TokenExchange = response.json().await?;

        if !status.is_success() || exchange.error_type.is_some() {
            return Err(TriageError::ProviderApi {
                status: status.as_u16(),
                message: exchange
                    .error_message
                    .or(exchange.error_type)
                    .unwrap_or_else(|| "token exchange failed".to_string()),
            });
        }
        let access_token = exchange
            .access_token
            .ok_or_else(|| TriageError::ProviderApi {
                status: status.as_u16(),
                message: "token exchange returned no access_token".to_string(),
            })?;

        // Note: tokens from the Instagram Login flow are not compatible with
        // the Basic Display long-lived exchange; the short-lived token is
        // stored as-is.
        let me_url = format!(
            "{GRAPH_URL}/me?fields=id,username,account_type,name&access_token={}",
            urlencode(&access_token)
        );
        let response = self.http.get(&me_url).send().await?;
        let status = response.status();
        let profile: MeProfile = response.json().await?;

        if !status.is_success() || profile.error.is_some() {
            return Err(TriageError::ProviderApi {
                status: status.as_u16(),
                message: profile
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "profile fetch failed".to_string()),
            });
        }

        let account_type = profile.account_type.as_deref().unwrap_or("");
        if account_type != "BUSINESS" && account_type != "MEDIA_CREATOR" {
            return Err(TriageError::InvalidRequest(
                "account is not professional; convert it to Business or Creator".to_string(),
            ));
        }

        Ok(ConnectedAccount {
            access_token,
            instagram_id: profile.id.unwrap_or_default(),
            username: profile.username.unwrap_or_default(),
        })
    }

    /// Authenticated lookup of a sender's display profile.
    pub async fn fetch_sender_profile(
        &self,
        access_token: &str,
        sender_id: &str,
    ) -> Result<SenderProfile, TriageError> {
        let url = format!(
            "{GRAPH_URL}/{sender_id}?fields=name,username,followers_count,profile_picture_url&access_token={}",
            urlencode(access_token)
        );

        let response = self
            .send_with_retry(self.http.get(&url))
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TriageError::ProviderApi {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }

    /// Send a text reply through the Instagram Send API. Returns the
    /// provider's message id.
    pub async fn send_message(
        &self,
        access_token: &str,
        instagram_user_id: &str,
        recipient_id: &str,
        text: &str,
    ) -> Result<String, TriageError> {
        let url = format!("{GRAPH_URL}/{SEND_API_VERSION}/{instagram_user_id}/messages");
        let body = serde_json::json!({
            "recipient": { "id": recipient_id },
            "message": { "text": text },
        });

        let request = self.http.post(&url).bearer_auth(access_token).json(&body);
        let response = self.send_with_retry(request).await?;
        let status = response.status();
        let reply: SendReply = response.json().await?;

        if !status.is_success() {
            return Err(TriageError::ProviderApi {
                status: status.as_u16(),
                message: reply
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "send failed".to_string()),
            });
        }

        Ok(reply.message_id.unwrap_or_default())
    }

    /// Bounded retry for transient provider failures.
    async fn send_with_retry(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TriageError> {
        let attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=attempts {
            let Some(cloned) = request.try_clone() else {
                return request.send().await.map_err(TriageError::Http);
            };

            match cloned.send().await {
                Ok(response) => {
                    let status = response.status();
                    if retryable_status(status) && attempt < attempts {
                        let delay = retry_delay(
                            attempt,
                            &self.retry,
                            response.headers().get(reqwest::header::RETRY_AFTER),
                        );
                        warn!(
                            attempt,
                            attempts,
                            status = status.as_u16(),
                            "instagram retry after status"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    let retryable_transport = err.is_timeout() || err.is_connect();
                    if retryable_transport && attempt < attempts {
                        let delay = retry_delay(attempt, &self.retry, None);
                        warn!(attempt, attempts, error = %err, "instagram retry after transport error");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(TriageError::Http(err));
                }
            }
        }

        Err(TriageError::ProviderApi {
            status: 0,
            message: "request exhausted retries".to_string(),
        })
    }
}

fn retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    Duration::from_millis(base)
}

/// Percent-encode a query string value.
fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[derive(Debug, Deserialize)]
struct TokenExchange {
    access_token: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MeProfile {
    id: Option<String>,
    username: Option<String>,
    account_type: Option<String>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct SendReply {
    message_id: Option<String>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}
