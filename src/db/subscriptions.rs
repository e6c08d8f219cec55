use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::{parse_ts, parse_ts_opt, ts, TriageDb};
use crate::error::TriageError;
use crate::types::{DbSubscription, SubscriptionStatus};

impl TriageDb {
    // =========================================================================
    // Subscriptions
    // =========================================================================

    pub fn get_subscription(&self, user_id: &str) -> Result<Option<DbSubscription>, TriageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = ?1"
        ))?;
        let sub = stmt.query_row(params![user_id], map_subscription).optional()?;
        Ok(sub)
    }

    /// Phase 1 candidates: active subscriptions whose paid period has lapsed.
    pub fn expired_active_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DbSubscription>, TriageError> {
        self.subscriptions_where(
            "status = 'active' AND expires_at IS NOT NULL AND expires_at < ?1",
            now,
        )
    }

    /// Phase 2 candidates: grace periods that have run out.
    pub fn expired_grace_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DbSubscription>, TriageError> {
        self.subscriptions_where(
            "status = 'grace_period' AND grace_period_until IS NOT NULL
             AND grace_period_until < ?1",
            now,
        )
    }

    /// Phase 3 candidates: blocked long enough to mark for deletion.
    pub fn stale_blocked_subscriptions(
        &self,
        blocked_cutoff: DateTime<Utc>,
    ) -> Result<Vec<DbSubscription>, TriageError> {
        self.subscriptions_where(
            "status = 'blocked' AND blocked_at IS NOT NULL AND blocked_at < ?1
             AND marked_for_deletion_at IS NULL",
            blocked_cutoff,
        )
    }

    /// Phase 4 candidates: everything marked for deletion.
    pub fn pending_deletion_subscriptions(&self) -> Result<Vec<DbSubscription>, TriageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE status = 'pending_deletion'"
        ))?;
        let rows = stmt.query_map([], map_subscription)?;
        let mut subs = Vec::new();
        for row in rows {
            subs.push(row?);
        }
        Ok(subs)
    }

    pub fn move_to_grace_period(
        &self,
        id: &str,
        grace_period_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), TriageError> {
        self.conn.execute(
            "UPDATE subscriptions
             SET status = 'grace_period', grace_period_until = ?1, updated_at = ?2
             WHERE id = ?3",
            params![ts(grace_period_until), ts(now), id],
        )?;
        Ok(())
    }

    pub fn move_to_blocked(&self, id: &str, now: DateTime<Utc>) -> Result<(), TriageError> {
        self.conn.execute(
            "UPDATE subscriptions
             SET status = 'blocked', blocked_at = ?1, updated_at = ?1
             WHERE id = ?2",
            params![ts(now), id],
        )?;
        Ok(())
    }

    pub fn mark_for_deletion(&self, id: &str, now: DateTime<Utc>) -> Result<(), TriageError> {
        self.conn.execute(
            "UPDATE subscriptions
             SET status = 'pending_deletion', marked_for_deletion_at = ?1, updated_at = ?1
             WHERE id = ?2",
            params![ts(now), id],
        )?;
        Ok(())
    }

    pub fn delete_subscription(&self, id: &str) -> Result<(), TriageError> {
        self.conn
            .execute("DELETE FROM subscriptions WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Payment reactivation — the one lifecycle write outside the sweep.
    /// Resets to `active` with a fresh expiry and clears the downstream
    /// state fields.
    pub fn reactivate_subscription(
        &self,
        user_id: &str,
        payment_id: Option<&str>,
        payment_method: Option<&str>,
        amount: Option<f64>,
        currency: Option<&str>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), TriageError> {
        self.conn.execute(
            "INSERT INTO subscriptions
                 (id, user_id, status, payment_id, payment_method, amount, currency,
                  started_at, expires_at, grace_period_until, blocked_at,
                  marked_for_deletion_at, updated_at)
             VALUES (?1, ?2, 'active', ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, NULL, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
                 status = 'active',
                 payment_id = excluded.payment_id,
                 payment_method = excluded.payment_method,
                 amount = excluded.amount,
                 currency = excluded.currency,
                 started_at = excluded.started_at,
                 expires_at = excluded.expires_at,
                 grace_period_until = NULL,
                 blocked_at = NULL,
                 marked_for_deletion_at = NULL,
                 updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                payment_id,
                payment_method,
                amount,
                currency,
                ts(now),
                ts(expires_at),
            ],
        )?;
        Ok(())
    }

    fn subscriptions_where(
        &self,
        predicate: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DbSubscription>, TriageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE {predicate}"
        ))?;
        let rows = stmt.query_map(params![ts(cutoff)], map_subscription)?;
        let mut subs = Vec::new();
        for row in rows {
            subs.push(row?);
        }
        Ok(subs)
    }

    /// Test helper: insert a subscription in an arbitrary lifecycle state.
    #[cfg(test)]
    #[allow(clippy::too_many_arguments)]
    pub fn insert_test_subscription(
        &self,
        user_id: &str,
        status: SubscriptionStatus,
        expires_at: Option<DateTime<Utc>>,
        grace_period_until: Option<DateTime<Utc>>,
        blocked_at: Option<DateTime<Utc>>,
        marked_for_deletion_at: Option<DateTime<Utc>>,
    ) -> Result<String, TriageError> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO subscriptions
                 (id, user_id, status, expires_at, grace_period_until, blocked_at,
                  marked_for_deletion_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                user_id,
                status,
                expires_at.map(ts),
                grace_period_until.map(ts),
                blocked_at.map(ts),
                marked_for_deletion_at.map(ts),
                ts(Utc::now()),
            ],
        )?;
        Ok(id)
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, status, payment_id, payment_method,
     amount, currency, started_at, expires_at, grace_period_until, blocked_at,
     marked_for_deletion_at, updated_at";

fn map_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbSubscription> {
    Ok(DbSubscription {
        id: row.get(0)?,
        user_id: row.get(1)?,
        status: row.get(2)?,
        payment_id: row.get(3)?,
        payment_method: row.get(4)?,
        amount: row.get(5)?,
        currency: row.get(6)?,
        started_at: parse_ts_opt(row.get(7)?)?,
        expires_at: parse_ts_opt(row.get(8)?)?,
        grace_period_until: parse_ts_opt(row.get(9)?)?,
        blocked_at: parse_ts_opt(row.get(10)?)?,
        marked_for_deletion_at: parse_ts_opt(row.get(11)?)?,
        updated_at: parse_ts(&row.get::<_, String>(12)?)?,
    })
}
