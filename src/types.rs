//! Domain types shared across intake, classification, and lifecycle.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Classification buckets
// ---------------------------------------------------------------------------

/// What the sender wants from the creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Partnership / sponsored-post proposal
    Partnership,
    /// Fan message or compliment
    Fan,
    /// Question about content
    Question,
    /// Hate or hostile criticism
    Hate,
    /// Spam or unsolicited sales
    Spam,
}

/// How urgently the creator should respond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    RespondNow,
    CanWait,
    Ignore,
}

/// Where a message sits in the classification pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationStatus {
    /// Inserted by intake, awaiting classification
    Pending,
    /// Soft-claimed by a batch run
    Processing,
    /// Classified via the LLM
    Classified,
    /// Classified deterministically without an LLM call
    Skipped,
}

/// Subscription lifecycle state. Absent a row, the implicit state is "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    GracePeriod,
    Blocked,
    PendingDeletion,
}

macro_rules! sql_text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                Self::parse(text).ok_or(FromSqlError::InvalidType)
            }
        }
    };
}

sql_text_enum!(Intent {
    Partnership => "partnership",
    Fan => "fan",
    Question => "question",
    Hate => "hate",
    Spam => "spam",
});

sql_text_enum!(Priority {
    RespondNow => "respond_now",
    CanWait => "can_wait",
    Ignore => "ignore",
});

sql_text_enum!(ClassificationStatus {
    Pending => "pending",
    Processing => "processing",
    Classified => "classified",
    Skipped => "skipped",
});

sql_text_enum!(SubscriptionStatus {
    Active => "active",
    GracePeriod => "grace_period",
    Blocked => "blocked",
    PendingDeletion => "pending_deletion",
});

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// A row from the `workspaces` table. One per creator, keyed to exactly one
/// Instagram identity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbWorkspace {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub instagram_page_id: String,
    pub created_at: DateTime<Utc>,
}

/// A row from the `messages` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMessage {
    pub id: String,
    pub workspace_id: String,
    pub instagram_message_id: Option<String>,
    pub sender_instagram_id: String,
    pub sender_username: Option<String>,
    pub sender_name: Option<String>,
    pub sender_avatar_url: Option<String>,
    pub sender_followers_count: Option<i64>,
    pub conversation_id: Option<String>,
    pub content: String,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub classification_status: ClassificationStatus,
}

/// Fields for inserting a message from webhook intake.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub workspace_id: String,
    pub instagram_message_id: Option<String>,
    pub sender_instagram_id: String,
    pub sender_username: Option<String>,
    pub sender_name: Option<String>,
    pub sender_avatar_url: Option<String>,
    pub sender_followers_count: Option<i64>,
    pub conversation_id: Option<String>,
    pub content: String,
    pub received_at: DateTime<Utc>,
}

/// A row from the `classifications` table — one-to-one with a message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbClassification {
    pub message_id: String,
    pub intent: Intent,
    pub priority: Priority,
    pub suggested_reply: Option<String>,
    pub confidence: f64,
    pub classified_at: DateTime<Utc>,
}

/// The classification outcome persisted for a message.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationResult {
    pub intent: Intent,
    pub priority: Priority,
    pub suggested_reply: Option<String>,
    pub confidence: f64,
}

/// A row from the `profiles` table — one per user, holds the (encrypted)
/// Instagram access token.
#[derive(Debug, Clone)]
pub struct DbProfile {
    pub user_id: String,
    pub instagram_id: Option<String>,
    pub instagram_username: Option<String>,
    pub instagram_access_token: Option<String>,
    pub token_encrypted: bool,
    pub api_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A row from the `subscriptions` table — one per user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSubscription {
    pub id: String,
    pub user_id: String,
    pub status: SubscriptionStatus,
    pub payment_id: Option<String>,
    pub payment_method: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub grace_period_until: Option<DateTime<Utc>>,
    pub blocked_at: Option<DateTime<Utc>>,
    pub marked_for_deletion_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_text_round_trip() {
        for intent in [
            Intent::Partnership,
            Intent::Fan,
            Intent::Question,
            Intent::Hate,
            Intent::Spam,
        ] {
            assert_eq!(Intent::parse(intent.as_str()), Some(intent));
        }
        assert_eq!(Priority::parse("respond_now"), Some(Priority::RespondNow));
        assert_eq!(
            SubscriptionStatus::parse("grace_period"),
            Some(SubscriptionStatus::GracePeriod)
        );
        assert_eq!(Intent::parse("unknown"), None);
    }

    #[test]
    fn test_serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&Priority::RespondNow).unwrap(),
            "\"respond_now\""
        );
        let intent: Intent = serde_json::from_str("\"partnership\"").unwrap();
        assert_eq!(intent, Intent::Partnership);
    }
}
