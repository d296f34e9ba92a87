use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use crate::auth::{ensure_clinic_access, require_role, RequestContext, Role};
use crate::error::{Error, Result};
use crate::models::subscription::{BillingEvent, Subscription};
use crate::models::AuditRecord;
use crate::store::Store;

use super::AppState;

/// Actor id recorded for mutations driven by the payment gateway rather
/// than a signed-in user.
pub const SYSTEM_ACTOR: i64 = 0;

/// Apply one billing event. Shared between the webhook endpoint and the
/// dead-letter retry job.
pub async fn apply_billing_event(store: &dyn Store, event: &BillingEvent) -> Result<Value> {
    match event {
        BillingEvent::PaymentSucceeded {
            subscription_id,
            period_start,
            period_end,
        } => {
            let mut sub = load_subscription(store, *subscription_id).await?;
            sub.record_payment(*period_start, *period_end)?;
            store.update_subscription(&sub).await?;
            audit_subscription(store, &sub, "payment_succeeded").await?;
            Ok(json!({ "success": true, "subscription": sub }))
        }
        BillingEvent::PaymentFailed { subscription_id } => {
            let mut sub = load_subscription(store, *subscription_id).await?;
            sub.record_payment_failure()?;
            store.update_subscription(&sub).await?;
            audit_subscription(store, &sub, "payment_failed").await?;
            Ok(json!({ "success": true, "subscription": sub }))
        }
        BillingEvent::SubscriptionCanceled { subscription_id } => {
            let mut sub = load_subscription(store, *subscription_id).await?;
            sub.cancel()?;
            store.update_subscription(&sub).await?;
            audit_subscription(store, &sub, "canceled").await?;
            Ok(json!({ "success": true, "subscription": sub }))
        }
        BillingEvent::RefillPayment { refill_id } => {
            let entry = store
                .refill(*refill_id)
                .await?
                .ok_or_else(|| Error::not_found(format!("Refill {} not found", refill_id)))?;
            // Gateways redeliver; a verified entry is a no-op, not an error.
            if entry.payment_verified {
                return Ok(json!({ "success": true, "refill": entry }));
            }
            let verified = store
                .verify_refill_payment(*refill_id)
                .await?
                .ok_or_else(|| {
                    Error::conflict(format!(
                        "Refill is not awaiting payment (status: {})",
                        entry.status
                    ))
                })?;
            store
                .record_audit(&AuditRecord::new(
                    verified.clinic_id,
                    SYSTEM_ACTOR,
                    "refill",
                    verified.id,
                    "payment_verified",
                    "pending_admin",
                ))
                .await?;
            tracing::info!(refill_id = verified.id, "refill payment verified");
            Ok(json!({ "success": true, "refill": verified }))
        }
    }
}

async fn load_subscription(store: &dyn Store, id: i64) -> Result<Subscription> {
    store
        .subscription(id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Subscription {} not found", id)))
}

async fn audit_subscription(store: &dyn Store, sub: &Subscription, action: &str) -> Result<()> {
    store
        .record_audit(&AuditRecord::new(
            sub.clinic_id,
            SYSTEM_ACTOR,
            "subscription",
            sub.id,
            action,
            sub.status.as_str(),
        ))
        .await?;
    tracing::info!(
        subscription_id = sub.id,
        status = %sub.status,
        action,
        "subscription billing event applied"
    );
    Ok(())
}

/// Best-effort clinic lookup for parking a failed event.
async fn clinic_for_event(store: &dyn Store, event: &BillingEvent) -> Option<i64> {
    match event {
        BillingEvent::PaymentSucceeded {
            subscription_id, ..
        }
        | BillingEvent::PaymentFailed { subscription_id }
        | BillingEvent::SubscriptionCanceled { subscription_id } => store
            .subscription(*subscription_id)
            .await
            .ok()
            .flatten()
            .map(|s| s.clinic_id),
        BillingEvent::RefillPayment { refill_id } => store
            .refill(*refill_id)
            .await
            .ok()
            .flatten()
            .map(|r| r.clinic_id),
    }
}

/// `POST /webhooks/billing` — payment gateway ingestion. Transient failures
/// are parked in the dead-letter queue for the retry job; the gateway still
/// sees the error and may retry on its own schedule.
pub async fn billing_webhook(
    State(state): State<AppState>,
    Json(event): Json<BillingEvent>,
) -> Result<Json<Value>> {
    let store = state.store.as_ref();
    match apply_billing_event(store, &event).await {
        Ok(body) => Ok(Json(body)),
        Err(err @ Error::Internal(_)) => {
            if let Some(clinic_id) = clinic_for_event(store, &event).await {
                let payload = serde_json::to_value(&event)?;
                if let Err(park_err) = store
                    .enqueue_dead_letter(clinic_id, &payload, &err.to_string())
                    .await
                {
                    tracing::error!(
                        error = %park_err,
                        "failed to park billing event for retry"
                    );
                }
            }
            Err(err)
        }
        Err(other) => Err(other),
    }
}

async fn mutate_subscription<F>(
    state: &AppState,
    ctx: &RequestContext,
    id: i64,
    action: &str,
    mutate: F,
) -> Result<Json<Value>>
where
    F: FnOnce(&mut Subscription) -> Result<()>,
{
    if id <= 0 {
        return Err(Error::validation("Subscription id must be a positive integer"));
    }
    let store = state.store.as_ref();

    let mut sub = load_subscription(store, id).await?;
    ensure_clinic_access(ctx, sub.clinic_id, format!("Subscription {}", id))?;
    require_role(ctx, &[Role::Admin, Role::SuperAdmin])?;

    mutate(&mut sub)?;
    store.update_subscription(&sub).await?;

    store
        .record_audit(&AuditRecord::new(
            sub.clinic_id,
            ctx.user_id,
            "subscription",
            id,
            action,
            sub.status.as_str(),
        ))
        .await?;
    tracing::info!(
        subscription_id = id,
        actor_id = ctx.user_id,
        action,
        "subscription updated by admin"
    );

    Ok(Json(json!({ "success": true, "subscription": sub })))
}

/// `POST /subscriptions/{id}/pause`
pub async fn pause_subscription(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    mutate_subscription(&state, &ctx, id, "pause", |sub| sub.pause()).await
}

/// `POST /subscriptions/{id}/resume`
pub async fn resume_subscription(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    mutate_subscription(&state, &ctx, id, "resume", |sub| sub.resume()).await
}

/// `POST /subscriptions/{id}/cancel`
pub async fn cancel_subscription(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    mutate_subscription(&state, &ctx, id, "cancel", |sub| sub.cancel()).await
}
