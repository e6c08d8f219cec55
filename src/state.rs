//! Shared service state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::classify::llm::{IntentClassifier, OpenAiClassifier};
use crate::config::Config;
use crate::crypto::TokenCipher;
use crate::db::TriageDb;
use crate::dispatch::ClassifyJob;
use crate::error::TriageError;
use crate::instagram::InstagramClient;

/// Everything the handlers and workers share. The database mutex is never
/// held across an await — reads/claims happen under the lock, network calls
/// happen outside it.
pub struct AppState {
    pub config: Config,
    pub db: Mutex<TriageDb>,
    pub cipher: TokenCipher,
    pub classifier: Arc<dyn IntentClassifier>,
    pub instagram: InstagramClient,
    pub classify_tx: mpsc::Sender<ClassifyJob>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: TriageDb,
        classify_tx: mpsc::Sender<ClassifyJob>,
    ) -> Result<Self, TriageError> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let cipher = TokenCipher::new(&config.encryption_key);
        let classifier: Arc<dyn IntentClassifier> = Arc::new(OpenAiClassifier::new(
            config.openai_api_key.clone(),
            timeout,
        )?);
        let instagram = InstagramClient::new(
            config.instagram_app_id.clone(),
            config.instagram_app_secret.clone(),
            timeout,
        )?;

        Ok(Self {
            config,
            db: Mutex::new(db),
            cipher,
            classifier,
            instagram,
            classify_tx,
        })
    }

    /// In-memory state with fake secrets and a live queue receiver, for
    /// tests that exercise intake and handler logic.
    #[cfg(test)]
    pub fn for_tests() -> (Self, mpsc::Receiver<ClassifyJob>) {
        let (tx, rx) = crate::dispatch::classify_channel();
        let config = Config::for_tests();
        let db = TriageDb::open_in_memory().expect("in-memory db");
        let state = Self::new(config, db, tx).expect("test state");
        (state, rx)
    }
}
