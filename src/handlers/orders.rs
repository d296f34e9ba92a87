use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{ensure_clinic_access, require_role, RequestContext, Role};
use crate::error::{Error, Result};
use crate::idempotency::{with_idempotency, RESOURCE_ORDER_DECLINE};
use crate::models::order::{Order, OrderStatus};
use crate::models::AuditRecord;
use crate::store::{Store, StoredResponse};

use super::{idempotency_key, AppState};

const MIN_DECLINE_REASON_LEN: usize = 10;

#[derive(Debug, Deserialize)]
pub struct DeclineBody {
    pub reason: String,
}

async fn load_scoped_order(store: &dyn Store, ctx: &RequestContext, id: i64) -> Result<Order> {
    if id <= 0 {
        return Err(Error::validation("Order id must be a positive integer"));
    }
    let order = store
        .order(id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Order {} not found", id)))?;
    ensure_clinic_access(ctx, order.clinic_id, format!("Order {}", id))?;
    Ok(order)
}

/// A provider may only close out an order they hold the claim on; admins
/// may close any order in their clinic.
fn ensure_order_actor(ctx: &RequestContext, order: &Order) -> Result<()> {
    require_role(ctx, &[Role::Provider, Role::Admin, Role::SuperAdmin])?;
    if ctx.role == Role::Provider && order.provider_id != Some(ctx.user_id) {
        return Err(Error::forbidden("Order is claimed by another provider"));
    }
    Ok(())
}

/// `POST /orders/{id}/decline` — decline the prescription with a reason.
/// The source refill entry is declined along with it. An `Idempotency-Key`
/// header replays the first outcome under client retry.
pub async fn decline_order(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<DeclineBody>,
) -> Result<StoredResponse> {
    let reason = body.reason.trim().to_string();
    if reason.len() < MIN_DECLINE_REASON_LEN {
        return Err(Error::validation(format!(
            "Decline reason must be at least {} characters",
            MIN_DECLINE_REASON_LEN
        )));
    }

    let store = state.store.clone();
    with_idempotency(
        store.as_ref(),
        &ctx,
        idempotency_key(&headers),
        RESOURCE_ORDER_DECLINE,
        || decline(store.as_ref(), &ctx, id, &reason),
    )
    .await
}

async fn decline(
    store: &dyn Store,
    ctx: &RequestContext,
    id: i64,
    reason: &str,
) -> Result<StoredResponse> {
    let order = load_scoped_order(store, ctx, id).await?;
    ensure_order_actor(ctx, &order)?;

    // The store declines the source refill entry in the same atomic step.
    let declined = store
        .finish_order(id, OrderStatus::Declined, Some(reason))
        .await?
        .ok_or_else(|| Error::conflict(format!("Order already {}", order.status)))?;

    store
        .record_audit(
            &AuditRecord::new(
                declined.clinic_id,
                ctx.user_id,
                "order",
                id,
                "decline",
                "declined",
            )
            .with_detail(reason),
        )
        .await?;
    tracing::info!(
        order_id = id,
        actor_id = ctx.user_id,
        reason,
        "order declined"
    );

    Ok(StoredResponse::ok(json!({ "success": true, "order": declined })))
}

/// `POST /orders/{id}/complete` — the prescription was issued and the order
/// is done. Completes the source refill entry as well.
pub async fn complete_order(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    let store = state.store.as_ref();

    let order = load_scoped_order(store, &ctx, id).await?;
    ensure_order_actor(&ctx, &order)?;
    if order.provider_id.is_none() {
        return Err(Error::conflict("Order has not been claimed yet"));
    }

    // The store completes the source refill entry in the same atomic step.
    let completed = store
        .finish_order(id, OrderStatus::Completed, None)
        .await?
        .ok_or_else(|| Error::conflict(format!("Order already {}", order.status)))?;

    store
        .record_audit(&AuditRecord::new(
            completed.clinic_id,
            ctx.user_id,
            "order",
            id,
            "complete",
            "completed",
        ))
        .await?;
    tracing::info!(order_id = id, actor_id = ctx.user_id, "order completed");

    Ok(Json(json!({ "success": true, "order": completed })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::order::NewOrder;
    use crate::models::refill::{NewRefill, RefillStatus};
    use crate::store::MemStore;
    use std::sync::Arc;

    fn provider_ctx(user_id: i64, clinic_id: i64) -> RequestContext {
        RequestContext {
            user_id,
            clinic_id,
            role: Role::Provider,
        }
    }

    fn admin_ctx(clinic_id: i64) -> RequestContext {
        RequestContext {
            user_id: 7,
            clinic_id,
            role: Role::Admin,
        }
    }

    /// Refill in provider review plus its queued order, claimed or not.
    async fn seeded(store: &MemStore, claimed_by: Option<i64>) -> (i64, i64) {
        let refill = store
            .insert_refill(NewRefill {
                patient_id: 1,
                clinic_id: 1,
                subscription_id: None,
                status: RefillStatus::PendingProvider,
                payment_verified: true,
                medication: "semaglutide 0.5mg".to_string(),
                ship_to_state: "TX".to_string(),
                shipment_number: 1,
                total_shipments: 1,
                parent_refill_id: None,
            })
            .await
            .unwrap();
        let order = store
            .insert_order(NewOrder {
                refill_id: refill.id,
                patient_id: 1,
                clinic_id: 1,
                medication: refill.medication.clone(),
                ship_to_state: refill.ship_to_state.clone(),
            })
            .await
            .unwrap();
        if let Some(provider_id) = claimed_by {
            store.claim_order(order.id, provider_id).await.unwrap();
        }
        (refill.id, order.id)
    }

    #[tokio::test]
    async fn test_decline_requires_reason_of_ten_chars() {
        let store = Arc::new(MemStore::new());
        let (_, order_id) = seeded(&store, Some(9)).await;

        let err = decline_order(
            State(AppState::new(store)),
            provider_ctx(9, 1),
            Path(order_id),
            HeaderMap::new(),
            Json(DeclineBody {
                reason: "too brief".to_string(),
            }),
        )
        .await
        .unwrap_err();
        match err {
            Error::Validation(msg) => {
                assert_eq!(msg, "Decline reason must be at least 10 characters")
            }
            other => panic!("expected Validation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decline_closes_order_and_refill() {
        let store = Arc::new(MemStore::new());
        let (refill_id, order_id) = seeded(&store, Some(9)).await;

        let response = decline_order(
            State(AppState::new(store.clone())),
            provider_ctx(9, 1),
            Path(order_id),
            HeaderMap::new(),
            Json(DeclineBody {
                reason: "interaction with current medication".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.body["order"]["status"], "declined");

        let refill = store.refill(refill_id).await.unwrap().unwrap();
        assert_eq!(refill.status, RefillStatus::Declined);

        let audits = store.audit_records();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].action, "decline");
        assert_eq!(
            audits[0].detail.as_deref(),
            Some("interaction with current medication")
        );
    }

    #[tokio::test]
    async fn test_decline_twice_is_conflict() {
        let store = Arc::new(MemStore::new());
        let (_, order_id) = seeded(&store, Some(9)).await;
        let state = AppState::new(store);
        let body = || {
            Json(DeclineBody {
                reason: "patient requested cancellation".to_string(),
            })
        };

        decline_order(
            State(state.clone()),
            provider_ctx(9, 1),
            Path(order_id),
            HeaderMap::new(),
            body(),
        )
        .await
        .unwrap();
        let err = decline_order(
            State(state),
            provider_ctx(9, 1),
            Path(order_id),
            HeaderMap::new(),
            body(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_decline_replays_under_idempotency_key() {
        let store = Arc::new(MemStore::new());
        let (_, order_id) = seeded(&store, Some(9)).await;
        let state = AppState::new(store);
        let mut headers = HeaderMap::new();
        headers.insert("idempotency-key", "decline-1".parse().unwrap());
        let body = || {
            Json(DeclineBody {
                reason: "patient requested cancellation".to_string(),
            })
        };

        let first = decline_order(
            State(state.clone()),
            provider_ctx(9, 1),
            Path(order_id),
            headers.clone(),
            body(),
        )
        .await
        .unwrap();
        // Same key replays the stored response instead of conflicting.
        let second = decline_order(
            State(state),
            provider_ctx(9, 1),
            Path(order_id),
            headers,
            body(),
        )
        .await
        .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_provider_cannot_decline_anothers_claim() {
        let store = Arc::new(MemStore::new());
        let (_, order_id) = seeded(&store, Some(9)).await;

        let err = decline_order(
            State(AppState::new(store)),
            provider_ctx(10, 1),
            Path(order_id),
            HeaderMap::new(),
            Json(DeclineBody {
                reason: "not comfortable prescribing this".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_admin_can_decline_unclaimed_order() {
        let store = Arc::new(MemStore::new());
        let (_, order_id) = seeded(&store, None).await;

        let result = decline_order(
            State(AppState::new(store)),
            admin_ctx(1),
            Path(order_id),
            HeaderMap::new(),
            Json(DeclineBody {
                reason: "duplicate of an earlier order".to_string(),
            }),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_complete_marks_refill_completed() {
        let store = Arc::new(MemStore::new());
        let (refill_id, order_id) = seeded(&store, Some(9)).await;

        let Json(body) = complete_order(
            State(AppState::new(store.clone())),
            provider_ctx(9, 1),
            Path(order_id),
        )
        .await
        .unwrap();
        assert_eq!(body["order"]["status"], "completed");

        let refill = store.refill(refill_id).await.unwrap().unwrap();
        assert_eq!(refill.status, RefillStatus::Completed);
    }

    #[tokio::test]
    async fn test_complete_unclaimed_is_conflict() {
        let store = Arc::new(MemStore::new());
        let (_, order_id) = seeded(&store, None).await;

        let err = complete_order(
            State(AppState::new(store)),
            admin_ctx(1),
            Path(order_id),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cross_tenant_order_reads_as_not_found() {
        let store = Arc::new(MemStore::new());
        let (_, order_id) = seeded(&store, Some(9)).await;

        let err = complete_order(
            State(AppState::new(store)),
            provider_ctx(9, 2),
            Path(order_id),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
