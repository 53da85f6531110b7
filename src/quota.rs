//! Quota & Policy Gate (§4.5): per-user counters checked and reserved
//! atomically before any billable action, against the tier policy table
//! loaded once at startup.
//!
//! Grounded on the pack's event-bus two-tier locking idiom: one outer
//! `parking_lot::Mutex` guards only map structure (which users have a
//! ledger at all); the hot path — incrementing one user's counters — takes
//! only that user's `tokio::sync::Mutex`, so concurrent requests from
//! different users never contend with each other.

use crate::config::{CapabilityBundle, PolicyTable};
use crate::model::{CounterKind, Tier, UsageCounter, UserId};
use crate::Error;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

type UserLedger = AsyncMutex<HashMap<CounterKind, UsageCounter>>;

/// An atomic increment that has been applied optimistically and awaits
/// [`QuotaGate::commit`] or [`QuotaGate::release`] (§4.5 "reservation").
pub struct Reservation {
    pub user_id: UserId,
    pub counter: CounterKind,
    pub cost: u64,
}

/// A feature flag gated per tier, distinct from the counter/model checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Council,
    Music,
    Jam,
    Training,
    DeveloperMode,
}

pub struct QuotaGate {
    policy: Arc<PolicyTable>,
    period: ChronoDuration,
    ledgers: SyncMutex<HashMap<UserId, Arc<UserLedger>>>,
}

impl QuotaGate {
    /// Billing period defaults to 30 days; callers with a real billing
    /// calendar should use [`QuotaGate::with_period`] instead.
    pub fn new(policy: Arc<PolicyTable>) -> Self {
        Self::with_period(policy, ChronoDuration::days(30))
    }

    pub fn with_period(policy: Arc<PolicyTable>, period: ChronoDuration) -> Self {
        Self {
            policy,
            period,
            ledgers: SyncMutex::new(HashMap::new()),
        }
    }

    fn ledger_for(&self, user_id: UserId) -> Arc<UserLedger> {
        self.ledgers
            .lock()
            .entry(user_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(HashMap::new())))
            .clone()
    }

    fn bundle_for(&self, tier: Tier) -> crate::Result<&CapabilityBundle> {
        self.policy
            .bundle_for(tier)
            .ok_or_else(|| Error::internal(format!("no policy bundle configured for tier {tier}")))
    }

    /// `messages_total` reads its limit straight off the bundle; every
    /// other counter kind is looked up by name in the per-model-family
    /// map, so a deployment opts a counter into enforcement just by
    /// naming it there. A counter with no configured limit is unbounded.
    fn limit_for(bundle: &CapabilityBundle, counter: CounterKind) -> Option<u64> {
        match counter {
            CounterKind::MessagesTotal => Some(bundle.max_messages_per_period),
            other => bundle.max_model_family_messages.get(&other.to_string()).copied(),
        }
    }

    /// Lazily resets a counter row once its period has elapsed (§4.5
    /// "period reset"), creating one at the tier's current limit if
    /// absent.
    fn current_row(row: Option<UsageCounter>, limit: u64, now: DateTime<Utc>, period: ChronoDuration) -> UsageCounter {
        match row {
            Some(existing) if existing.period_reset_at > now => UsageCounter { limit, ..existing },
            _ => UsageCounter {
                count: 0,
                limit,
                period_start: now,
                period_reset_at: now + period,
            },
        }
    }

    /// `check(user, counter, cost)` (§4.5): whether `cost` more of
    /// `counter` would still fit under the tier's limit, without
    /// reserving anything.
    pub async fn check(&self, user_id: UserId, tier: Tier, counter: CounterKind, cost: u64) -> crate::Result<()> {
        let bundle = self.bundle_for(tier)?;
        let Some(limit) = Self::limit_for(bundle, counter) else {
            return Ok(());
        };

        let ledger = self.ledger_for(user_id);
        let mut rows = ledger.lock().await;
        let now = Utc::now();
        let row = Self::current_row(rows.get(&counter).copied(), limit, now, self.period);
        let result = if row.count + cost > row.limit {
            Err(Error::over_quota(counter.to_string(), row.period_reset_at))
        } else {
            Ok(())
        };
        rows.insert(counter, row);
        result
    }

    /// `reserve(user, counter, cost)` (§4.5): atomically checks and
    /// increments under the per-user lock so concurrent requests from the
    /// same user can never both observe room for a cost that only fits
    /// once (invariant 6, §8).
    pub async fn reserve(&self, user_id: UserId, tier: Tier, counter: CounterKind, cost: u64) -> crate::Result<Reservation> {
        let bundle = self.bundle_for(tier)?;
        let Some(limit) = Self::limit_for(bundle, counter) else {
            return Ok(Reservation {
                user_id,
                counter,
                cost: 0,
            });
        };

        let ledger = self.ledger_for(user_id);
        let mut rows = ledger.lock().await;
        let now = Utc::now();
        let mut row = Self::current_row(rows.get(&counter).copied(), limit, now, self.period);
        if row.count + cost > row.limit {
            let reset_at = row.period_reset_at;
            rows.insert(counter, row);
            return Err(Error::over_quota(counter.to_string(), reset_at));
        }
        row.count += cost;
        rows.insert(counter, row);
        Ok(Reservation { user_id, counter, cost })
    }

    /// Commits a reservation, optionally replacing its pre-flight estimate
    /// with the action's actual cost (e.g. real token usage in place of
    /// the default estimate of 1).
    pub async fn commit(&self, reservation: Reservation, actual_cost: Option<u64>) {
        let Some(actual) = actual_cost else { return };
        if actual == reservation.cost {
            return;
        }
        let ledger = self.ledger_for(reservation.user_id);
        let mut rows = ledger.lock().await;
        if let Some(row) = rows.get_mut(&reservation.counter) {
            row.count = row.count.saturating_sub(reservation.cost) + actual;
        }
    }

    /// Releases a reservation's optimistic increment because the
    /// downstream action failed before it could commit (§4.5).
    pub async fn release(&self, reservation: Reservation) {
        let ledger = self.ledger_for(reservation.user_id);
        let mut rows = ledger.lock().await;
        if let Some(row) = rows.get_mut(&reservation.counter) {
            row.count = row.count.saturating_sub(reservation.cost);
        }
    }

    /// The tier's conversation-tail token budget, for feeding
    /// `load_conversation_tail` (§4.7).
    pub fn context_window_for(&self, tier: Tier) -> Option<usize> {
        self.policy.bundle_for(tier).map(|bundle| bundle.max_context_window_tokens)
    }

    pub fn allowed_model(&self, tier: Tier, model_id: &str) -> bool {
        self.policy
            .bundle_for(tier)
            .map(|b| b.allows_model(model_id))
            .unwrap_or(false)
    }

    pub fn allowed_tools(&self, tier: Tier) -> bool {
        self.policy.bundle_for(tier).map(|b| b.tools_enabled).unwrap_or(false)
    }

    pub fn allowed_feature(&self, tier: Tier, feature: Feature) -> bool {
        let Some(bundle) = self.policy.bundle_for(tier) else {
            return false;
        };
        match feature {
            Feature::Council => bundle.council_enabled,
            Feature::Music => bundle.music_enabled,
            Feature::Jam => bundle.jam_enabled,
            Feature::Training => bundle.training_enabled,
            Feature::DeveloperMode => bundle.developer_mode_enabled,
        }
    }
}
