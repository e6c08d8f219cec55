//! Classification engine — per-message and batched entry points sharing one
//! contract.
//!
//! The single path is triggered right after webhook intake; the batch path
//! runs on an external schedule and exists because rapid-fire messages from
//! one sender are cheaper and better answered when considered together. The
//! batch window is purely a selection criterion on `received_at` — nothing
//! here sleeps.
//!
//! The database lock is never held across an LLM call: candidates are read
//! and claimed under the lock, the call happens unlocked, the result is
//! persisted under a fresh lock.

pub mod llm;
pub mod skip;

use std::collections::{HashMap, HashSet};

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::db::TriageDb;
use crate::error::TriageError;
use crate::types::{ClassificationResult, ClassificationStatus, DbMessage, Intent, Priority};

use llm::{ClassifyRequest, IntentClassifier};
use skip::should_skip;

/// Confidence recorded for LLM-sourced classifications.
pub const LLM_CONFIDENCE: f64 = 0.85;

/// Confidence recorded for deterministic (heuristic/duplicate) skips.
pub const HEURISTIC_CONFIDENCE: f64 = 1.0;

/// Tunables for a batch run, taken from `Config`.
#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub window_minutes: i64,
    pub limit: usize,
    pub lease_minutes: i64,
}

/// Outcome of a batch run.
#[derive(Debug, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub skipped: usize,
    pub results: Vec<BatchResult>,
}

#[derive(Debug, Serialize)]
pub struct BatchResult {
    pub id: String,
    pub intent: Intent,
    pub priority: Priority,
    pub suggested_reply: Option<String>,
}

fn skip_result() -> ClassificationResult {
    ClassificationResult {
        intent: Intent::Fan,
        priority: Priority::Ignore,
        suggested_reply: None,
        confidence: HEURISTIC_CONFIDENCE,
    }
}

// ---------------------------------------------------------------------------
// Single-message path
// ---------------------------------------------------------------------------

/// Classify one message by id. Heuristic matches never reach the LLM. On an
/// LLM failure the message stays `pending` and the error propagates — the
/// dispatch worker logs it and the batch path retries later.
pub async fn classify_message(
    db: &Mutex<TriageDb>,
    classifier: &dyn IntentClassifier,
    message_id: &str,
) -> Result<ClassificationResult, TriageError> {
    let message = db
        .lock()
        .get_message(message_id)?
        .ok_or(TriageError::NotFound("message"))?;

    if let Some(reason) = should_skip(&message.content) {
        info!(message_id, reason = reason.label(), "heuristic skip");
        let result = skip_result();
        let guard = db.lock();
        guard.upsert_classification(message_id, &result, Utc::now())?;
        guard.set_classification_status(message_id, ClassificationStatus::Skipped)?;
        return Ok(result);
    }

    let outcome = classifier.classify(&request_for(&message)).await?;
    let result = ClassificationResult {
        intent: outcome.intent,
        priority: outcome.priority,
        suggested_reply: outcome.suggested_reply,
        confidence: LLM_CONFIDENCE,
    };

    let guard = db.lock();
    guard.upsert_classification(message_id, &result, Utc::now())?;
    guard.set_classification_status(message_id, ClassificationStatus::Classified)?;
    Ok(result)
}

// ---------------------------------------------------------------------------
// Batch path
// ---------------------------------------------------------------------------

/// Run one batch classification pass.
///
/// Selection: `pending` messages older than the batch window (plus stale
/// `processing` claims past the lease), oldest first, capped. Messages are
/// grouped by conversation, soft-claimed as `processing`, then classified or
/// skipped one by one. A duplicate of content already handled in the same
/// group is skipped — answering the same text twice adds no value. One
/// message's LLM failure resets it to `pending` and never aborts siblings.
pub async fn classify_batch(
    db: &Mutex<TriageDb>,
    classifier: &dyn IntentClassifier,
    settings: &BatchSettings,
) -> Result<BatchSummary, TriageError> {
    let now = Utc::now();
    let window_cutoff = now - Duration::minutes(settings.window_minutes);
    let lease_cutoff = now - Duration::minutes(settings.lease_minutes);

    let candidates = db
        .lock()
        .batch_candidates(window_cutoff, lease_cutoff, settings.limit)?;

    if candidates.is_empty() {
        return Ok(BatchSummary {
            processed: 0,
            skipped: 0,
            results: Vec::new(),
        });
    }

    info!(count = candidates.len(), "batch classification run");

    // Group by conversation, falling back to the sender id
    let mut groups: HashMap<String, Vec<DbMessage>> = HashMap::new();
    for message in candidates {
        let key = message
            .conversation_id
            .clone()
            .unwrap_or_else(|| message.sender_instagram_id.clone());
        groups.entry(key).or_default().push(message);
    }

    let mut processed = 0;
    let mut skipped = 0;
    let mut results = Vec::new();

    for (conversation, messages) in groups {
        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        db.lock().mark_processing(&ids, Utc::now())?;

        // First occurrence of each normalized content may reach the LLM;
        // repeats within the burst are skipped outright.
        let mut seen: HashSet<String> = HashSet::new();

        for message in &messages {
            let normalized = message.content.trim().to_lowercase();
            let repeated = !seen.insert(normalized);
            let heuristic = should_skip(&message.content);

            if heuristic.is_some() || repeated {
                let result = skip_result();
                let guard = db.lock();
                guard.upsert_classification(&message.id, &result, Utc::now())?;
                guard.set_classification_status(&message.id, ClassificationStatus::Skipped)?;
                skipped += 1;
                continue;
            }

            match classifier.classify(&request_for(message)).await {
                Ok(outcome) => {
                    let result = ClassificationResult {
                        intent: outcome.intent,
                        priority: outcome.priority,
                        suggested_reply: outcome.suggested_reply,
                        confidence: LLM_CONFIDENCE,
                    };
                    let guard = db.lock();
                    guard.upsert_classification(&message.id, &result, Utc::now())?;
                    guard.set_classification_status(
                        &message.id,
                        ClassificationStatus::Classified,
                    )?;
                    processed += 1;
                    results.push(BatchResult {
                        id: message.id.clone(),
                        intent: result.intent,
                        priority: result.priority,
                        suggested_reply: result.suggested_reply,
                    });
                }
                Err(e) => {
                    // Back to pending so the next run retries it
                    warn!(
                        message_id = %message.id,
                        conversation = %conversation,
                        error = %e,
                        "classification failed, leaving for retry"
                    );
                    db.lock()
                        .set_classification_status(&message.id, ClassificationStatus::Pending)?;
                }
            }
        }
    }

    info!(processed, skipped, "batch complete");
    Ok(BatchSummary {
        processed,
        skipped,
        results,
    })
}

fn request_for(message: &DbMessage) -> ClassifyRequest {
    ClassifyRequest {
        content: message.content.clone(),
        sender_name: message.sender_name.clone(),
        sender_username: message.sender_username.clone(),
        follower_count: message.sender_followers_count,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration;

    use super::llm::LlmClassification;
    use super::*;
    use crate::db::messages::test_message;
    use crate::types::NewMessage;

    /// Classifier double: counts calls, returns a fixed bucket or an error.
    struct FakeClassifier {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeClassifier {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IntentClassifier for FakeClassifier {
        async fn classify(
            &self,
            _request: &ClassifyRequest,
        ) -> Result<LlmClassification, TriageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TriageError::LlmApi {
                    status: 500,
                    message: "upstream down".to_string(),
                });
            }
            Ok(LlmClassification {
                intent: Intent::Question,
                priority: Priority::RespondNow,
                suggested_reply: Some("Oi! Já te respondo.".to_string()),
            })
        }
    }

    fn aged(mut msg: NewMessage, minutes: i64) -> NewMessage {
        msg.received_at = Utc::now() - Duration::minutes(minutes);
        msg
    }

    fn settings() -> BatchSettings {
        BatchSettings {
            window_minutes: 4,
            limit: 50,
            lease_minutes: 10,
        }
    }

    #[tokio::test]
    async fn test_single_heuristic_skip_never_calls_llm() {
        let db = Mutex::new(TriageDb::open_in_memory().unwrap());
        let classifier = FakeClassifier::new();
        let msg = db
            .lock()
            .insert_message(&test_message("ws-1", "sender-1", "❤️"))
            .unwrap();

        let result = classify_message(&db, &classifier, &msg.id).await.unwrap();

        assert_eq!(classifier.call_count(), 0);
        assert_eq!(result.intent, Intent::Fan);
        assert_eq!(result.priority, Priority::Ignore);
        assert!(result.suggested_reply.is_none());
        assert_eq!(result.confidence, 1.0);

        let guard = db.lock();
        let stored = guard.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(stored.classification_status, ClassificationStatus::Skipped);
    }

    #[tokio::test]
    async fn test_single_llm_path_persists_classified() {
        let db = Mutex::new(TriageDb::open_in_memory().unwrap());
        let classifier = FakeClassifier::new();
        let msg = db
            .lock()
            .insert_message(&test_message("ws-1", "sender-1", "oi, tudo bem?"))
            .unwrap();

        let result = classify_message(&db, &classifier, &msg.id).await.unwrap();

        // Boundary case: 3 words, 13 chars — too_short must NOT trigger
        assert_eq!(classifier.call_count(), 1);
        assert_eq!(result.confidence, LLM_CONFIDENCE);

        let guard = db.lock();
        let stored = guard.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(stored.classification_status, ClassificationStatus::Classified);
        assert!(guard.get_classification(&msg.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_single_llm_failure_leaves_pending() {
        let db = Mutex::new(TriageDb::open_in_memory().unwrap());
        let classifier = FakeClassifier::failing();
        let msg = db
            .lock()
            .insert_message(&test_message("ws-1", "sender-1", "me explica uma coisa?"))
            .unwrap();

        let err = classify_message(&db, &classifier, &msg.id).await.unwrap_err();
        assert!(err.is_retryable());

        let guard = db.lock();
        let stored = guard.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(stored.classification_status, ClassificationStatus::Pending);
        assert!(guard.get_classification(&msg.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_dedups_repeated_content_within_group() {
        let db = Mutex::new(TriageDb::open_in_memory().unwrap());
        let classifier = FakeClassifier::new();

        // Three identical messages in one burst, plus a distinct one
        let mut ids = Vec::new();
        for _ in 0..3 {
            let msg = db
                .lock()
                .insert_message(&aged(
                    test_message("ws-1", "sender-1", "Me responde por favor!"),
                    10,
                ))
                .unwrap();
            ids.push(msg.id);
        }
        let distinct = db
            .lock()
            .insert_message(&aged(
                test_message("ws-1", "sender-1", "onde comprou a câmera?"),
                10,
            ))
            .unwrap();

        let summary = classify_batch(&db, &classifier, &settings()).await.unwrap();

        // First duplicate + the distinct message hit the LLM; two repeats skip
        assert_eq!(classifier.call_count(), 2);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.skipped, 2);

        let guard = db.lock();
        let classified = ids
            .iter()
            .filter(|id| {
                guard.get_message(id).unwrap().unwrap().classification_status
                    == ClassificationStatus::Classified
            })
            .count();
        assert_eq!(classified, 1);
        assert_eq!(
            guard
                .get_message(&distinct.id)
                .unwrap()
                .unwrap()
                .classification_status,
            ClassificationStatus::Classified
        );
        // Repeats still got their deterministic fan/ignore row
        for id in &ids {
            assert!(guard.get_classification(id).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_batch_ignores_messages_inside_window() {
        let db = Mutex::new(TriageDb::open_in_memory().unwrap());
        let classifier = FakeClassifier::new();

        db.lock()
            .insert_message(&aged(
                test_message("ws-1", "sender-1", "mandei agora mesmo, responde!"),
                1,
            ))
            .unwrap();

        let summary = classify_batch(&db, &classifier, &settings()).await.unwrap();

        assert_eq!(classifier.call_count(), 0);
        assert_eq!(summary.processed + summary.skipped, 0);
    }

    #[tokio::test]
    async fn test_batch_failure_resets_to_pending_and_continues() {
        let db = Mutex::new(TriageDb::open_in_memory().unwrap());
        let classifier = FakeClassifier::failing();

        let llm_bound = db
            .lock()
            .insert_message(&aged(
                test_message("ws-1", "sender-1", "proposta de parceria pra você"),
                10,
            ))
            .unwrap();
        // Different conversation; heuristic skip — must still be handled
        let emoji = db
            .lock()
            .insert_message(&aged(test_message("ws-1", "sender-2", "❤️"), 10))
            .unwrap();

        let summary = classify_batch(&db, &classifier, &settings()).await.unwrap();

        assert_eq!(summary.processed, 0);
        assert_eq!(summary.skipped, 1);

        let guard = db.lock();
        assert_eq!(
            guard
                .get_message(&llm_bound.id)
                .unwrap()
                .unwrap()
                .classification_status,
            ClassificationStatus::Pending
        );
        assert_eq!(
            guard
                .get_message(&emoji.id)
                .unwrap()
                .unwrap()
                .classification_status,
            ClassificationStatus::Skipped
        );
    }

    #[tokio::test]
    async fn test_batch_no_duplicate_discount_across_conversations() {
        let db = Mutex::new(TriageDb::open_in_memory().unwrap());
        let classifier = FakeClassifier::new();

        // Same text from two different senders — both reach the LLM
        for sender in ["sender-1", "sender-2"] {
            db.lock()
                .insert_message(&aged(
                    test_message("ws-1", sender, "qual mic você usa nos vídeos?"),
                    10,
                ))
                .unwrap();
        }

        let summary = classify_batch(&db, &classifier, &settings()).await.unwrap();
        assert_eq!(classifier.call_count(), 2);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test]
    async fn test_batch_leaves_no_processing_rows() {
        let db = Mutex::new(TriageDb::open_in_memory().unwrap());
        let classifier = FakeClassifier::new();

        for content in ["oi, tudo bem por aí?", "❤️", "fechamos a publi?"] {
            db.lock()
                .insert_message(&aged(test_message("ws-1", "sender-1", content), 10))
                .unwrap();
        }

        classify_batch(&db, &classifier, &settings()).await.unwrap();

        let guard = db.lock();
        let processing: i64 = guard
            .conn_ref()
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE classification_status = 'processing'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(processing, 0);
    }
}
