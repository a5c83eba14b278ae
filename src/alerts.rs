//! Alert manager: per-user subscriptions and the fire/suppress decision on
//! free transitions.
//!
//! Baseline semantics, in decision order:
//!
//! 1. Expired subscriptions are deactivated and skipped (a no-op, not an
//!    error).
//! 2. Quiet hours suppress-and-drop: the alert is not queued for later
//!    delivery and the subscription stays armed. Freeness is only worth
//!    telling someone about right now; they can re-subscribe.
//! 3. A fire inside the cooldown of the previous one is suppressed
//!    (flap protection).
//! 4. Otherwise the fire is recorded idempotently keyed on
//!    (subscription id, transition id) and the subscription is consumed
//!    (single-shot).
//!
//! All times on this path are source timestamps from the transition being
//! evaluated, so the decision is deterministic and replayable.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::model::{
    AlertFire, AlertSubscription, SubscribeRequest, SubscribeResponse, TransitionRecord,
};
use crate::notify::{self, Notifier};
use crate::storage::Storage;

/// Outcome of the pure fire/suppress decision for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireDecision {
    Expired,
    QuietHours,
    Cooldown,
    Fire,
}

/// Hour of day at the site, given an epoch-seconds timestamp and the
/// configured UTC offset.
pub fn site_local_hour(ts: i64, offset_minutes: i64) -> u32 {
    let shifted = ts + offset_minutes * 60;
    shifted.div_euclid(3600).rem_euclid(24) as u32
}

/// Decide fire/suppress for one subscription against a free transition at
/// `ts`. Pure; the side effects live in [`evaluate_free_transition`].
pub fn decide(sub: &AlertSubscription, ts: i64, cfg: &Config) -> FireDecision {
    if ts > sub.expiry_ts {
        return FireDecision::Expired;
    }

    let local_hour = site_local_hour(ts, cfg.local_offset_minutes);
    if sub.in_quiet_hours(local_hour) {
        return FireDecision::QuietHours;
    }

    if let Some(last_fired) = sub.last_fired_ts {
        if ts - last_fired < cfg.alert_cooldown_secs {
            return FireDecision::Cooldown;
        }
    }

    FireDecision::Fire
}

/// Create a subscription for (subscriber, unit), replacing any prior active
/// one for the pair. Returns the id and computed expiry.
pub async fn subscribe(
    storage: &Storage,
    req: &SubscribeRequest,
    cfg: &Config,
    now_ts: i64,
) -> Result<SubscribeResponse> {
    let expiry_ts = now_ts + cfg.subscription_ttl_secs;
    let sub = storage
        .create_subscription(
            &req.subscriber_id,
            &req.unit_id,
            now_ts,
            expiry_ts,
            req.quiet_start_hour % 24,
            req.quiet_end_hour % 24,
        )
        .await?;

    info!(
        subscription_id = sub.id,
        subscriber_id = %req.subscriber_id,
        unit_id = %req.unit_id,
        expiry_ts,
        "Subscription created"
    );

    Ok(SubscribeResponse {
        subscription_id: sub.id,
        expiry_ts,
    })
}

/// Cancel a subscription. Returns whether it was active.
pub async fn unsubscribe(storage: &Storage, id: i64) -> Result<bool> {
    storage.deactivate_subscription(id).await
}

/// Evaluate every active subscription for a unit that just became free.
///
/// At most one fire is ever emitted per (subscription, transition): the
/// delivery-record insert is the serialization point, and only its winner
/// consumes the subscription and dispatches. Delivery itself is bounded
/// retry-then-drop; a failed delivery is logged and does not undo the fire.
pub async fn evaluate_free_transition(
    storage: &Storage,
    record: &TransitionRecord,
    cfg: &Config,
    notifier: &Arc<dyn Notifier>,
) -> Result<()> {
    let subs = storage.active_subscriptions_for_unit(&record.unit_id).await?;

    for sub in subs {
        match decide(&sub, record.ts, cfg) {
            FireDecision::Expired => {
                storage.deactivate_subscription(sub.id).await?;
                debug!(subscription_id = sub.id, "Subscription expired");
            }
            FireDecision::QuietHours => {
                debug!(
                    subscription_id = sub.id,
                    unit_id = %record.unit_id,
                    "Fire suppressed by quiet hours"
                );
            }
            FireDecision::Cooldown => {
                debug!(
                    subscription_id = sub.id,
                    unit_id = %record.unit_id,
                    "Fire suppressed by cooldown"
                );
            }
            FireDecision::Fire => {
                // Claim (subscription, transition) exactly once
                if !storage.try_record_fire(sub.id, record.id, record.ts).await? {
                    debug!(
                        subscription_id = sub.id,
                        transition_id = record.id,
                        "Fire already claimed for this transition"
                    );
                    continue;
                }

                storage.mark_subscription_fired(sub.id, record.ts).await?;

                let fire = AlertFire {
                    subscription_id: sub.id,
                    unit_id: record.unit_id.clone(),
                    fired_at: record.ts,
                };

                info!(
                    subscription_id = sub.id,
                    unit_id = %record.unit_id,
                    transition_id = record.id,
                    "Alert fired"
                );

                if let Err(e) =
                    notify::deliver_with_retry(notifier.as_ref(), &fire, cfg.delivery_retry_attempts)
                        .await
                {
                    warn!(
                        subscription_id = sub.id,
                        error = %e,
                        "Alert delivery dropped"
                    );
                }
            }
        }
    }

    Ok(())
}
