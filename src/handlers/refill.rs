use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{ensure_clinic_access, require_role, RequestContext, Role};
use crate::error::{Error, Result};
use crate::idempotency::{with_idempotency, RESOURCE_REFILL_APPROVE};
use crate::models::refill::{approval_guard, RefillStatus};
use crate::models::AuditRecord;
use crate::store::{Store, StoredResponse};

use super::{idempotency_key, AppState};

#[derive(Debug, Deserialize)]
pub struct ApproveBody {
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
}

/// `GET /refill-queue` — the clinic's queue, optionally filtered by status.
pub async fn list_refills(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>> {
    require_role(&ctx, &[Role::Admin, Role::SuperAdmin])?;

    let status = params
        .status
        .as_deref()
        .map(|raw| {
            RefillStatus::parse(raw)
                .ok_or_else(|| Error::validation(format!("Unknown refill status: {}", raw)))
        })
        .transpose()?;

    let refills = state.store.refills_for_clinic(ctx.clinic_id, status).await?;
    Ok(Json(json!({ "refills": refills })))
}

/// `POST /refill-queue/{id}/approve` — the admin approval gate.
///
/// An `Idempotency-Key` header makes the transition at-most-once under
/// client retry: the stored response is replayed instead of re-running.
pub async fn approve_refill(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<ApproveBody>,
) -> Result<StoredResponse> {
    if id <= 0 {
        return Err(Error::validation("Refill id must be a positive integer"));
    }

    let store = state.store.clone();
    let notes = body.notes.as_deref();
    with_idempotency(
        store.as_ref(),
        &ctx,
        idempotency_key(&headers),
        RESOURCE_REFILL_APPROVE,
        || approve(store.as_ref(), &ctx, id, notes),
    )
    .await
}

/// The approval transition itself. Preconditions are checked in a fixed
/// order so each failure has a distinct, stable reason; the state change is
/// a single conditional update, so a concurrent approval loses cleanly.
async fn approve(
    store: &dyn Store,
    ctx: &RequestContext,
    id: i64,
    notes: Option<&str>,
) -> Result<StoredResponse> {
    let entry = store
        .refill(id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Refill {} not found", id)))?;
    ensure_clinic_access(ctx, entry.clinic_id, format!("Refill {}", id))?;
    require_role(ctx, &[Role::Admin, Role::SuperAdmin])?;
    approval_guard(&entry)?;

    // The store creates the fulfillment order in the same atomic step.
    let (approved, order) = store
        .approve_refill(id, ctx.user_id, notes, Utc::now())
        .await?
        .ok_or_else(|| Error::conflict("Refill was approved concurrently"))?;

    let mut audit = AuditRecord::new(
        approved.clinic_id,
        ctx.user_id,
        "refill",
        id,
        "approve",
        "approved",
    );
    if let Some(notes) = notes {
        audit = audit.with_detail(notes);
    }
    store.record_audit(&audit).await?;
    tracing::info!(
        refill_id = id,
        actor_id = ctx.user_id,
        order_id = order.id,
        "refill approved for provider review"
    );

    Ok(StoredResponse::ok(json!({
        "success": true,
        "refill": approved,
        "order_id": order.id,
    })))
}

/// `POST /refill-queue/{id}/cancel` — admin cancellation of an open entry.
pub async fn cancel_refill(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    if id <= 0 {
        return Err(Error::validation("Refill id must be a positive integer"));
    }
    let store = &state.store;

    let entry = store
        .refill(id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Refill {} not found", id)))?;
    ensure_clinic_access(&ctx, entry.clinic_id, format!("Refill {}", id))?;
    require_role(&ctx, &[Role::Admin, Role::SuperAdmin])?;

    if entry.status.is_terminal() {
        return Err(Error::conflict(format!("Refill already {}", entry.status)));
    }

    let cancelled = store
        .transition_refill(
            id,
            &[
                RefillStatus::PendingPayment,
                RefillStatus::PendingAdmin,
                RefillStatus::PendingProvider,
            ],
            RefillStatus::Cancelled,
        )
        .await?
        .ok_or_else(|| Error::conflict("Refill was closed concurrently"))?;

    store
        .record_audit(&AuditRecord::new(
            cancelled.clinic_id,
            ctx.user_id,
            "refill",
            id,
            "cancel",
            "cancelled",
        ))
        .await?;
    tracing::info!(refill_id = id, actor_id = ctx.user_id, "refill cancelled");

    Ok(Json(json!({ "success": true, "refill": cancelled })))
}
