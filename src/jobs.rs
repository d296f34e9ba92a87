//! Scheduled maintenance jobs. Both jobs walk clinics one at a time and
//! capture per-clinic failures so one tenant's bad data or outage never
//! stalls the rest.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::handlers::subscriptions::{apply_billing_event, SYSTEM_ACTOR};
use crate::models::order::Order;
use crate::models::refill::NewRefill;
use crate::models::routing::RoutingStrategy;
use crate::models::subscription::BillingEvent;
use crate::models::{AuditRecord, RefillStatus};
use crate::store::Store;

/// A parked webhook event is retried at most this many times before it is
/// abandoned.
pub const MAX_WEBHOOK_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct ClinicFailure {
    pub clinic_id: i64,
    pub reason: String,
}

/// Outcome of one `refill_due_sweep` run.
#[derive(Debug, Default, Serialize)]
pub struct SweepSummary {
    pub clinics_processed: usize,
    pub entries_created: usize,
    pub orders_assigned: usize,
    pub failures: Vec<ClinicFailure>,
}

/// Outcome of one `retry_failed_webhooks` run.
#[derive(Debug, Default, Serialize)]
pub struct RetrySummary {
    pub clinics_processed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub abandoned: usize,
    pub failures: Vec<ClinicFailure>,
}

/// Queue a refill entry for every subscription whose billing date has come
/// due, then hand out any waiting orders in clinics that auto-route.
pub async fn refill_due_sweep(store: &dyn Store, now: DateTime<Utc>) -> Result<SweepSummary> {
    let mut summary = SweepSummary::default();
    for clinic_id in store.clinic_ids().await? {
        match sweep_clinic(store, clinic_id, now).await {
            Ok((created, assigned)) => {
                summary.clinics_processed += 1;
                summary.entries_created += created;
                summary.orders_assigned += assigned;
            }
            Err(err) => {
                tracing::warn!(clinic_id, error = %err, "refill sweep failed for clinic");
                summary.failures.push(ClinicFailure {
                    clinic_id,
                    reason: err.to_string(),
                });
            }
        }
    }
    tracing::info!(
        clinics = summary.clinics_processed,
        entries = summary.entries_created,
        assigned = summary.orders_assigned,
        failed_clinics = summary.failures.len(),
        "refill due sweep finished"
    );
    Ok(summary)
}

async fn sweep_clinic(
    store: &dyn Store,
    clinic_id: i64,
    now: DateTime<Utc>,
) -> Result<(usize, usize)> {
    let mut created = 0;
    for sub in store.due_subscriptions(clinic_id, now).await? {
        // One open entry per subscription; the previous one must close first.
        if store.open_refill_for_subscription(sub.id).await?.is_some() {
            continue;
        }
        let entry = store
            .insert_refill(NewRefill {
                patient_id: sub.patient_id,
                clinic_id: sub.clinic_id,
                subscription_id: Some(sub.id),
                status: RefillStatus::PendingPayment,
                payment_verified: false,
                medication: sub.medication.clone(),
                ship_to_state: sub.ship_to_state.clone(),
                shipment_number: 1,
                total_shipments: 1,
                parent_refill_id: None,
            })
            .await?;
        store
            .record_audit(&AuditRecord::new(
                clinic_id,
                SYSTEM_ACTOR,
                "refill",
                entry.id,
                "queue",
                "pending_payment",
            ))
            .await?;
        created += 1;
    }

    let mut assigned = 0;
    let auto_route = store
        .routing_config(clinic_id)
        .await?
        .map(|c| c.routing_enabled && c.strategy == RoutingStrategy::RoundRobin)
        .unwrap_or(false);
    if auto_route {
        for order in store.unassigned_orders(clinic_id, None).await? {
            if assign_round_robin(store, clinic_id, &order).await?.is_some() {
                assigned += 1;
            }
        }
    }
    Ok((created, assigned))
}

/// Hand the order to the licensed provider with the fewest open orders.
/// Ties break toward the lower provider id. `None` when nobody in the
/// clinic is licensed for the ship-to state or the claim raced away.
async fn assign_round_robin(
    store: &dyn Store,
    clinic_id: i64,
    order: &Order,
) -> Result<Option<i64>> {
    let mut best: Option<(i64, i64)> = None;
    for provider in store.providers_for_clinic(clinic_id).await? {
        if !provider.licensed_in(&order.ship_to_state) {
            continue;
        }
        let open = store.open_order_count(provider.id).await?;
        if best.map(|(_, load)| open < load).unwrap_or(true) {
            best = Some((provider.id, open));
        }
    }
    let Some((provider_id, _)) = best else {
        return Ok(None);
    };
    if store.claim_order(order.id, provider_id).await?.is_none() {
        return Ok(None);
    }
    store
        .record_audit(&AuditRecord::new(
            clinic_id,
            SYSTEM_ACTOR,
            "order",
            order.id,
            "auto_assign",
            "claimed",
        ))
        .await?;
    tracing::info!(order_id = order.id, provider_id, "order auto-assigned");
    Ok(Some(provider_id))
}

/// Re-apply parked billing events. Transient failures stay parked with the
/// attempt counted; domain rejections (missing entity, stale state) will
/// never succeed and are marked delivered so they stop retrying.
pub async fn retry_failed_webhooks(store: &dyn Store) -> Result<RetrySummary> {
    let mut summary = RetrySummary::default();
    for clinic_id in store.clinic_ids().await? {
        match retry_clinic(store, clinic_id, &mut summary).await {
            Ok(()) => summary.clinics_processed += 1,
            Err(err) => {
                tracing::warn!(clinic_id, error = %err, "webhook retry failed for clinic");
                summary.failures.push(ClinicFailure {
                    clinic_id,
                    reason: err.to_string(),
                });
            }
        }
    }
    tracing::info!(
        clinics = summary.clinics_processed,
        delivered = summary.delivered,
        retried = summary.retried,
        abandoned = summary.abandoned,
        "webhook retry finished"
    );
    Ok(summary)
}

async fn retry_clinic(
    store: &dyn Store,
    clinic_id: i64,
    summary: &mut RetrySummary,
) -> Result<()> {
    for letter in store
        .undelivered_dead_letters(clinic_id, MAX_WEBHOOK_ATTEMPTS)
        .await?
    {
        let event: BillingEvent = match serde_json::from_value(letter.payload.clone()) {
            Ok(event) => event,
            Err(err) => {
                store
                    .record_dead_letter_attempt(letter.id, true, Some(&err.to_string()))
                    .await?;
                summary.abandoned += 1;
                continue;
            }
        };
        match apply_billing_event(store, &event).await {
            Ok(_) => {
                store
                    .record_dead_letter_attempt(letter.id, true, None)
                    .await?;
                summary.delivered += 1;
            }
            Err(err @ Error::Internal(_)) => {
                store
                    .record_dead_letter_attempt(letter.id, false, Some(&err.to_string()))
                    .await?;
                summary.retried += 1;
            }
            Err(err) => {
                store
                    .record_dead_letter_attempt(letter.id, true, Some(&err.to_string()))
                    .await?;
                summary.abandoned += 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::order::NewOrder;
    use crate::models::routing::{Provider, RoutingConfig};
    use crate::models::subscription::{Subscription, SubscriptionStatus};
    use crate::store::memory::FailingStore;
    use crate::store::MemStore;
    use chrono::Duration;
    use serde_json::json;

    fn due_subscription(id: i64, clinic_id: i64) -> Subscription {
        let now = Utc::now();
        Subscription {
            id,
            patient_id: id * 10,
            clinic_id,
            status: SubscriptionStatus::Active,
            medication: "semaglutide 0.5mg".to_string(),
            ship_to_state: "TX".to_string(),
            current_period_start: now - Duration::days(30),
            current_period_end: now - Duration::days(1),
            next_billing_date: Some(now - Duration::days(1)),
            created_at: now,
            updated_at: now,
        }
    }

    fn routing(clinic_id: i64, enabled: bool, strategy: RoutingStrategy) -> RoutingConfig {
        RoutingConfig {
            clinic_id,
            routing_enabled: enabled,
            strategy,
        }
    }

    #[tokio::test]
    async fn test_sweep_queues_due_subscriptions_once() {
        let store = MemStore::new();
        store.seed_subscription(due_subscription(5, 1));
        let mut not_due = due_subscription(6, 1);
        not_due.next_billing_date = Some(Utc::now() + Duration::days(10));
        store.seed_subscription(not_due);

        let summary = refill_due_sweep(&store, Utc::now()).await.unwrap();
        assert_eq!(summary.entries_created, 1);
        assert!(summary.failures.is_empty());

        let entries = store.refills_for_clinic(1, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, RefillStatus::PendingPayment);
        assert_eq!(entries[0].subscription_id, Some(5));

        // The open entry blocks a second sweep from double-queueing.
        let again = refill_due_sweep(&store, Utc::now()).await.unwrap();
        assert_eq!(again.entries_created, 0);
        assert_eq!(store.refills_for_clinic(1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_assigns_round_robin_to_least_loaded() {
        let store = MemStore::new();
        store.seed_clinic(routing(1, true, RoutingStrategy::RoundRobin));
        store.seed_provider(Provider {
            id: 9,
            clinic_id: 1,
            display_name: "Dr. 9".to_string(),
            licensed_states: vec!["TX".to_string()],
        });
        store.seed_provider(Provider {
            id: 10,
            clinic_id: 1,
            display_name: "Dr. 10".to_string(),
            licensed_states: vec!["TX".to_string()],
        });

        // Dr. 9 already holds one open order.
        let held = store
            .insert_order(NewOrder {
                refill_id: 1,
                patient_id: 1,
                clinic_id: 1,
                medication: "semaglutide 0.5mg".to_string(),
                ship_to_state: "TX".to_string(),
            })
            .await
            .unwrap();
        store.claim_order(held.id, 9).await.unwrap();

        let waiting = store
            .insert_order(NewOrder {
                refill_id: 2,
                patient_id: 2,
                clinic_id: 1,
                medication: "semaglutide 0.5mg".to_string(),
                ship_to_state: "TX".to_string(),
            })
            .await
            .unwrap();

        let summary = refill_due_sweep(&store, Utc::now()).await.unwrap();
        assert_eq!(summary.orders_assigned, 1);
        let order = store.order(waiting.id).await.unwrap().unwrap();
        assert_eq!(order.provider_id, Some(10));
    }

    #[tokio::test]
    async fn test_sweep_skips_assignment_without_licensed_provider() {
        let store = MemStore::new();
        store.seed_clinic(routing(1, true, RoutingStrategy::RoundRobin));
        store.seed_provider(Provider {
            id: 9,
            clinic_id: 1,
            display_name: "Dr. 9".to_string(),
            licensed_states: vec!["CA".to_string()],
        });
        let order = store
            .insert_order(NewOrder {
                refill_id: 1,
                patient_id: 1,
                clinic_id: 1,
                medication: "semaglutide 0.5mg".to_string(),
                ship_to_state: "TX".to_string(),
            })
            .await
            .unwrap();

        let summary = refill_due_sweep(&store, Utc::now()).await.unwrap();
        assert_eq!(summary.orders_assigned, 0);
        let order = store.order(order.id).await.unwrap().unwrap();
        assert!(order.provider_id.is_none());
    }

    #[tokio::test]
    async fn test_sweep_leaves_provider_choice_clinics_alone() {
        let store = MemStore::new();
        store.seed_clinic(routing(1, true, RoutingStrategy::ProviderChoice));
        store.seed_provider(Provider {
            id: 9,
            clinic_id: 1,
            display_name: "Dr. 9".to_string(),
            licensed_states: vec!["TX".to_string()],
        });
        store
            .insert_order(NewOrder {
                refill_id: 1,
                patient_id: 1,
                clinic_id: 1,
                medication: "semaglutide 0.5mg".to_string(),
                ship_to_state: "TX".to_string(),
            })
            .await
            .unwrap();

        let summary = refill_due_sweep(&store, Utc::now()).await.unwrap();
        assert_eq!(summary.orders_assigned, 0);
    }

    #[tokio::test]
    async fn test_sweep_isolates_failing_clinic() {
        let inner = MemStore::new();
        inner.seed_subscription(due_subscription(5, 1));
        inner.seed_subscription(due_subscription(6, 2));
        let store = FailingStore {
            fail_due_for: Some(1),
            ..FailingStore::new(inner)
        };

        let summary = refill_due_sweep(&store, Utc::now()).await.unwrap();
        assert_eq!(summary.clinics_processed, 1);
        assert_eq!(summary.entries_created, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].clinic_id, 1);

        // The healthy clinic's entry is queued despite the neighbor's outage.
        assert_eq!(store.refills_for_clinic(2, None).await.unwrap().len(), 1);
        assert!(store.refills_for_clinic(1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_delivers_parked_refill_payment() {
        let store = MemStore::new();
        let entry = store
            .insert_refill(NewRefill {
                patient_id: 1,
                clinic_id: 1,
                subscription_id: None,
                status: RefillStatus::PendingPayment,
                payment_verified: false,
                medication: "semaglutide 0.5mg".to_string(),
                ship_to_state: "TX".to_string(),
                shipment_number: 1,
                total_shipments: 1,
                parent_refill_id: None,
            })
            .await
            .unwrap();
        store
            .enqueue_dead_letter(
                1,
                &json!({ "type": "refill_payment", "refill_id": entry.id }),
                "db down",
            )
            .await
            .unwrap();

        let summary = retry_failed_webhooks(&store).await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.retried, 0);

        let refill = store.refill(entry.id).await.unwrap().unwrap();
        assert_eq!(refill.status, RefillStatus::PendingAdmin);

        // Nothing left to retry on the next run.
        let again = retry_failed_webhooks(&store).await.unwrap();
        assert_eq!(again.delivered + again.retried + again.abandoned, 0);
    }

    #[tokio::test]
    async fn test_retry_abandons_permanent_failures() {
        let store = MemStore::new();
        store.seed_subscription(due_subscription(5, 1));
        store
            .enqueue_dead_letter(
                1,
                &json!({ "type": "refill_payment", "refill_id": 999 }),
                "db down",
            )
            .await
            .unwrap();

        let summary = retry_failed_webhooks(&store).await.unwrap();
        assert_eq!(summary.abandoned, 1);
        // Marked delivered so it never comes back.
        let again = retry_failed_webhooks(&store).await.unwrap();
        assert_eq!(again.abandoned, 0);
    }

    #[tokio::test]
    async fn test_retry_stops_after_max_attempts() {
        let inner = MemStore::new();
        inner.seed_subscription(due_subscription(5, 1));
        inner
            .enqueue_dead_letter(1, &json!({ "type": "payment_failed", "subscription_id": 5 }), "db down")
            .await
            .unwrap();
        let store = FailingStore {
            fail_subscriptions: true,
            ..FailingStore::new(inner)
        };

        let mut transient_retries = 0;
        for _ in 0..8 {
            transient_retries += retry_failed_webhooks(&store).await.unwrap().retried;
        }
        // Enqueued with one attempt on record; retried until the cap.
        assert_eq!(transient_retries as i32, MAX_WEBHOOK_ATTEMPTS - 1);

        let letters = store.inner.dead_letters();
        assert_eq!(letters[0].attempts, MAX_WEBHOOK_ATTEMPTS);
        assert!(!letters[0].delivered);
    }
}
