//! Webhook intake: parse provider deliveries, resolve the owning workspace,
//! persist inbound messages, and hand them to the classification queue.
//!
//! The provider must always get its 200 promptly — enrichment failures,
//! unknown pages, and queue pressure are all absorbed here, never surfaced
//! to the webhook caller.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::dispatch::ClassifyJob;
use crate::state::AppState;
use crate::types::NewMessage;

/// Top-level object tag for deliveries this service processes.
const PROVIDER_OBJECT: &str = "instagram";

// ---------------------------------------------------------------------------
// Delivery payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    pub id: String,
    /// Direct per-event list
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
    /// Nested "changes" shape carrying the same logical events
    #[serde(default)]
    pub changes: Vec<ChangeEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagingEvent {
    #[serde(default)]
    pub sender: Option<EventParty>,
    #[serde(default)]
    pub message: Option<MessagePayload>,
    /// Epoch milliseconds
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventParty {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeEvent {
    #[serde(default)]
    pub value: Option<ChangeValue>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub messages: Vec<MessagingEvent>,
}

impl WebhookEntry {
    /// Union of both delivery shapes — they encode the same "message
    /// received" fact.
    pub fn events(&self) -> Vec<&MessagingEvent> {
        let mut events: Vec<&MessagingEvent> = self.messaging.iter().collect();
        for change in &self.changes {
            if let Some(value) = &change.value {
                events.extend(value.messages.iter());
            }
        }
        events
    }
}

/// Counts for one processed delivery. Only logged — the provider always
/// receives the same ack.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IntakeOutcome {
    pub inserted: usize,
    pub skipped: usize,
}

// ---------------------------------------------------------------------------
// Delivery processing
// ---------------------------------------------------------------------------

/// Process one webhook delivery. Never fails on bad entries — unknown pages
/// and malformed events are expected noise and counted as skips.
pub async fn process_delivery(state: &AppState, payload: WebhookPayload) -> IntakeOutcome {
    let mut outcome = IntakeOutcome::default();

    if payload.object.as_deref() != Some(PROVIDER_OBJECT) {
        debug!(object = ?payload.object, "ignoring non-instagram delivery");
        return outcome;
    }

    for entry in &payload.entry {
        let workspace = match state.db.lock().find_workspace_by_page_id(&entry.id) {
            Ok(Some(workspace)) => workspace,
            Ok(None) => {
                // Shared webhook subscriptions deliver pages we don't own
                debug!(page_id = %entry.id, "no workspace for page, skipping entry");
                continue;
            }
            Err(e) => {
                warn!(page_id = %entry.id, error = %e, "workspace lookup failed, skipping entry");
                continue;
            }
        };

        for event in entry.events() {
            let Some(sender_id) = event.sender.as_ref().map(|s| s.id.as_str()) else {
                outcome.skipped += 1;
                continue;
            };
            let Some(text) = event.message.as_ref().and_then(|m| m.text.as_deref()) else {
                // Media-only or malformed event
                outcome.skipped += 1;
                continue;
            };
            if sender_id == entry.id {
                // Echo of our own outgoing message — never re-ingest
                outcome.skipped += 1;
                continue;
            }

            let profile = enrich_sender(state, &workspace.owner_id, sender_id).await;

            let new = NewMessage {
                workspace_id: workspace.id.clone(),
                instagram_message_id: event.message.as_ref().and_then(|m| m.mid.clone()),
                sender_instagram_id: sender_id.to_string(),
                sender_username: profile.username.clone(),
                sender_name: profile.name.clone(),
                sender_avatar_url: profile.avatar_url.clone(),
                sender_followers_count: profile.follower_count,
                conversation_id: None,
                content: text.to_string(),
                received_at: event_time(event),
            };

            let message = match state.db.lock().insert_message(&new) {
                Ok(message) => message,
                Err(e) => {
                    warn!(sender_id, error = %e, "message insert failed");
                    outcome.skipped += 1;
                    continue;
                }
            };

            info!(message_id = %message.id, sender_id, "message ingested");
            outcome.inserted += 1;

            // Hand off to the background classifier without waiting. A full
            // queue is fine — the batch path picks the message up later.
            if let Err(e) = state.classify_tx.try_send(ClassifyJob {
                message_id: message.id.clone(),
            }) {
                warn!(message_id = %message.id, error = %e, "classification queue full");
            }
        }
    }

    outcome
}

/// Look up the sender's display profile with the workspace owner's token.
/// Any failure here returns empty fields — enrichment never blocks intake.
async fn enrich_sender(
    state: &AppState,
    owner_id: &str,
    sender_id: &str,
) -> crate::instagram::SenderProfile {
    let token = {
        let guard = state.db.lock();
        match guard.get_profile(owner_id) {
            Ok(Some(profile)) => {
                match (profile.instagram_access_token, profile.token_encrypted) {
                    (Some(stored), true) => match state.cipher.decrypt(&stored) {
                        Ok(token) => Some(token),
                        Err(e) => {
                            warn!(owner_id, error = %e, "token decrypt failed, skipping enrichment");
                            None
                        }
                    },
                    (Some(stored), false) => Some(stored),
                    (None, _) => None,
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!(owner_id, error = %e, "profile lookup failed, skipping enrichment");
                None
            }
        }
    };

    let Some(token) = token else {
        return Default::default();
    };

    match state.instagram.fetch_sender_profile(&token, sender_id).await {
        Ok(profile) => profile,
        Err(e) => {
            warn!(sender_id, error = %e, "sender enrichment failed, storing nulls");
            Default::default()
        }
    }
}

fn event_time(event: &MessagingEvent) -> DateTime<Utc> {
    event
        .timestamp
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use crate::types::ClassificationStatus;

    fn delivery(json: serde_json::Value) -> WebhookPayload {
        serde_json::from_value(json).unwrap()
    }

    fn message_event(sender: &str, text: &str) -> serde_json::Value {
        serde_json::json!({
            "sender": { "id": sender },
            "message": { "mid": "mid-1", "text": text },
            "timestamp": 1_756_000_000_000i64
        })
    }

    #[test]
    fn test_entry_unions_both_event_shapes() {
        let payload = delivery(serde_json::json!({
            "object": "instagram",
            "entry": [{
                "id": "page-1",
                "messaging": [message_event("sender-a", "oi")],
                "changes": [{ "value": { "messages": [message_event("sender-b", "olá")] } }]
            }]
        }));

        assert_eq!(payload.entry[0].events().len(), 2);
    }

    #[tokio::test]
    async fn test_delivery_ingests_and_marks_pending() {
        let (state, mut rx) = AppState::for_tests();
        state
            .db
            .lock()
            .upsert_workspace("user-1", "@creator", "page-1")
            .unwrap();

        let outcome = process_delivery(
            &state,
            delivery(serde_json::json!({
                "object": "instagram",
                "entry": [{
                    "id": "page-1",
                    "messaging": [message_event("sender-a", "oi, tudo bem?")]
                }]
            })),
        )
        .await;

        assert_eq!(outcome, IntakeOutcome { inserted: 1, skipped: 0 });

        // The message is queued for classification, not classified inline
        let job = rx.try_recv().unwrap();
        let guard = state.db.lock();
        let message = guard.get_message(&job.message_id).unwrap().unwrap();
        assert_eq!(message.content, "oi, tudo bem?");
        assert_eq!(message.classification_status, ClassificationStatus::Pending);
        assert_eq!(message.instagram_message_id.as_deref(), Some("mid-1"));
    }

    #[tokio::test]
    async fn test_delivery_skips_echo_media_and_unknown_page() {
        let (state, mut rx) = AppState::for_tests();
        state
            .db
            .lock()
            .upsert_workspace("user-1", "@creator", "page-1")
            .unwrap();

        let outcome = process_delivery(
            &state,
            delivery(serde_json::json!({
                "object": "instagram",
                "entry": [
                    {
                        "id": "page-1",
                        "messaging": [
                            // Echo of our own outgoing message
                            message_event("page-1", "respondi!"),
                            // Media-only event
                            { "sender": { "id": "sender-a" }, "message": { "mid": "m2" } },
                            // Missing sender
                            { "message": { "mid": "m3", "text": "quem sou eu?" } }
                        ]
                    },
                    {
                        // Unknown page — entry skipped entirely
                        "id": "stranger-page",
                        "messaging": [message_event("sender-b", "mensagem perdida")]
                    }
                ]
            })),
        )
        .await;

        assert_eq!(outcome, IntakeOutcome { inserted: 0, skipped: 3 });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_non_instagram_object_is_ignored() {
        let (state, mut rx) = AppState::for_tests();

        let outcome = process_delivery(
            &state,
            delivery(serde_json::json!({
                "object": "page",
                "entry": [{ "id": "page-1", "messaging": [message_event("s", "oi")] }]
            })),
        )
        .await;

        assert_eq!(outcome, IntakeOutcome::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_enrichment_absent_profile_stores_nulls() {
        let (state, mut rx) = AppState::for_tests();
        state
            .db
            .lock()
            .upsert_workspace("user-1", "@creator", "page-1")
            .unwrap();
        // No profile row for user-1 — enrichment is skipped, insert proceeds

        process_delivery(
            &state,
            delivery(serde_json::json!({
                "object": "instagram",
                "entry": [{
                    "id": "page-1",
                    "messaging": [message_event("sender-a", "adorei o último vídeo!")]
                }]
            })),
        )
        .await;

        let job = rx.try_recv().unwrap();
        let guard = state.db.lock();
        let message = guard.get_message(&job.message_id).unwrap().unwrap();
        assert!(message.sender_name.is_none());
        assert!(message.sender_followers_count.is_none());
    }
}
