//! Background classification dispatch.
//!
//! Webhook intake must ack the provider immediately, so classification runs
//! on a bounded queue drained by a single worker task. Failure is visible
//! (logged with the message id) and recoverable: the message stays
//! `pending`, and the externally-scheduled batch run retries it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::classify;
use crate::state::AppState;

/// Queue capacity. Overflow is not an error — intake logs and moves on,
/// leaving the message for the batch path.
pub const QUEUE_CAPACITY: usize = 256;

/// A request to classify one freshly-ingested message.
#[derive(Debug, Clone)]
pub struct ClassifyJob {
    pub message_id: String,
}

pub fn classify_channel() -> (mpsc::Sender<ClassifyJob>, mpsc::Receiver<ClassifyJob>) {
    mpsc::channel(QUEUE_CAPACITY)
}

/// Drain the classification queue until the sender side closes.
pub async fn run_classify_worker(state: Arc<AppState>, mut rx: mpsc::Receiver<ClassifyJob>) {
    info!("classification worker started");

    while let Some(job) = rx.recv().await {
        match classify::classify_message(&state.db, state.classifier.as_ref(), &job.message_id)
            .await
        {
            Ok(result) => {
                debug!(
                    message_id = %job.message_id,
                    intent = result.intent.as_str(),
                    priority = result.priority.as_str(),
                    "message classified"
                );
            }
            Err(e) => {
                // Non-fatal: the row stays pending for the batch run
                warn!(message_id = %job.message_id, error = %e, "queued classification failed");
            }
        }
    }

    info!("classification worker stopped");
}
