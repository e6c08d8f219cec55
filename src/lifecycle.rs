//! Subscription lifecycle sweep.
//!
//! Time-driven state machine advanced by an externally-scheduled run:
//! active → grace_period → blocked → pending_deletion → deleted. Each phase
//! is its own query; a phase's fetch failure yields zero rows and never
//! aborts the others. A subscription advances at most one transition per
//! sweep — except pending_deletion, whose cascade completes in the same
//! sweep it is marked.
//!
//! The cascade order is an invariant, not an implementation detail:
//! classifications → messages → workspace (per owned workspace), then
//! profile, then the subscription row. The auth identity record is left
//! intact; removing it needs elevated privileges outside this core.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::db::TriageDb;

/// Counts of rows moved through each transition in one sweep.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub updated_to_grace: usize,
    pub updated_to_blocked: usize,
    pub marked_for_deletion: usize,
    pub deleted_accounts: usize,
    pub timestamp: DateTime<Utc>,
}

/// Tunables for a sweep, taken from `Config`.
#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    pub grace_period_days: i64,
    pub deletion_after_days: i64,
}

/// Run one full lifecycle sweep. Safe to re-invoke at any cadence;
/// at-least-once external triggering is assumed.
pub fn run_sweep(db: &Mutex<TriageDb>, settings: &SweepSettings) -> SweepSummary {
    let now = Utc::now();
    let guard = db.lock();

    // Phase 1: lapsed active subscriptions get a soft landing
    let mut updated_to_grace = 0;
    let mut graced_ids: HashSet<String> = HashSet::new();
    for sub in fetch_phase(guard.expired_active_subscriptions(now), "expired active") {
        let Some(expires_at) = sub.expires_at else {
            continue;
        };
        let until = expires_at + Duration::days(settings.grace_period_days);
        match guard.move_to_grace_period(&sub.id, until, now) {
            Ok(()) => {
                info!(subscription = %sub.id, until = %until, "moved to grace period");
                graced_ids.insert(sub.id);
                updated_to_grace += 1;
            }
            Err(e) => error!(subscription = %sub.id, error = %e, "grace transition failed"),
        }
    }

    // Phase 2: grace periods that ran out. Rows graced in this very sweep
    // are excluded — one transition per sweep.
    let mut updated_to_blocked = 0;
    for sub in fetch_phase(guard.expired_grace_subscriptions(now), "expired grace") {
        if graced_ids.contains(&sub.id) {
            continue;
        }
        match guard.move_to_blocked(&sub.id, now) {
            Ok(()) => {
                info!(subscription = %sub.id, "moved to blocked");
                updated_to_blocked += 1;
            }
            Err(e) => error!(subscription = %sub.id, error = %e, "block transition failed"),
        }
    }

    // Phase 3: blocked long enough to mark for deletion
    let blocked_cutoff = now - Duration::days(settings.deletion_after_days);
    let mut marked_for_deletion = 0;
    for sub in fetch_phase(guard.stale_blocked_subscriptions(blocked_cutoff), "stale blocked") {
        match guard.mark_for_deletion(&sub.id, now) {
            Ok(()) => {
                info!(subscription = %sub.id, user = %sub.user_id, "marked for deletion");
                marked_for_deletion += 1;
            }
            Err(e) => error!(subscription = %sub.id, error = %e, "mark transition failed"),
        }
    }

    // Phase 4: cascade every pending_deletion account — including those
    // marked moments ago; their 30 days already passed.
    let mut deleted_accounts = 0;
    for sub in fetch_phase(guard.pending_deletion_subscriptions(), "pending deletion") {
        match delete_account_data(&guard, &sub.user_id, &sub.id) {
            Ok(()) => {
                info!(user = %sub.user_id, "account data deleted");
                deleted_accounts += 1;
            }
            Err(e) => error!(user = %sub.user_id, error = %e, "account deletion failed"),
        }
    }

    let summary = SweepSummary {
        updated_to_grace,
        updated_to_blocked,
        marked_for_deletion,
        deleted_accounts,
        timestamp: now,
    };
    info!(?summary, "subscription sweep complete");
    summary
}

fn fetch_phase<T>(
    result: Result<Vec<T>, crate::error::TriageError>,
    phase: &str,
) -> Vec<T> {
    match result {
        Ok(rows) => rows,
        Err(e) => {
            error!(phase, error = %e, "phase fetch failed");
            Vec::new()
        }
    }
}

/// Ordered cascade for one account.
fn delete_account_data(
    db: &TriageDb,
    user_id: &str,
    subscription_id: &str,
) -> Result<(), crate::error::TriageError> {
    for workspace in db.workspaces_for_owner(user_id)? {
        let message_ids = db.message_ids_for_workspace(&workspace.id)?;
        db.delete_classifications_for_messages(&message_ids)?;
        db.delete_messages(&message_ids)?;
        db.delete_workspace(&workspace.id)?;
    }
    db.delete_profile(user_id)?;
    db.delete_subscription(subscription_id)?;
    Ok(())
}
