use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{ensure_clinic_access, require_role, RequestContext, Role};
use crate::error::{Error, Result};
use crate::models::order::OrderStatus;
use crate::models::routing::{Provider, RoutingConfig};
use crate::models::AuditRecord;
use crate::store::Store;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct ClaimBody {
    pub order_id: i64,
}

async fn enabled_config(store: &dyn Store, clinic_id: i64) -> Result<Option<RoutingConfig>> {
    Ok(store
        .routing_config(clinic_id)
        .await?
        .filter(|c| c.routing_enabled))
}

async fn provider_profile(store: &dyn Store, ctx: &RequestContext) -> Result<Provider> {
    let provider = store
        .provider(ctx.user_id)
        .await?
        .filter(|p| p.clinic_id == ctx.clinic_id)
        .ok_or_else(|| Error::forbidden("No provider profile for caller"))?;
    Ok(provider)
}

/// `GET /provider/routing/available` — the caller's pull pool and claimed
/// queue. The pool is always restricted to states the provider is licensed
/// in; when routing is disabled for the clinic both lists are empty.
pub async fn available_prescriptions(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<Value>> {
    require_role(&ctx, &[Role::Provider])?;
    let store = state.store.as_ref();

    if enabled_config(store, ctx.clinic_id).await?.is_none() {
        return Ok(Json(json!({
            "enabled": false,
            "available": [],
            "assigned": [],
        })));
    }

    let provider = provider_profile(store, &ctx).await?;
    let available = store
        .unassigned_orders(ctx.clinic_id, Some(&provider.licensed_states))
        .await?;
    let assigned = store.orders_for_provider(ctx.clinic_id, ctx.user_id).await?;

    Ok(Json(json!({
        "enabled": true,
        "available": available,
        "assigned": assigned,
    })))
}

/// `POST /provider/routing/claim` — atomically claim a queued order. The
/// race between listing and claiming is closed by a single conditional
/// update in the store; the loser gets a conflict.
pub async fn claim_prescription(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<ClaimBody>,
) -> Result<Json<Value>> {
    if body.order_id <= 0 {
        return Err(Error::validation("Order id must be a positive integer"));
    }
    require_role(&ctx, &[Role::Provider])?;
    let store = state.store.as_ref();

    if enabled_config(store, ctx.clinic_id).await?.is_none() {
        return Err(Error::conflict(
            "Provider routing is disabled for this clinic",
        ));
    }
    let provider = provider_profile(store, &ctx).await?;

    let order = store
        .order(body.order_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Order {} not found", body.order_id)))?;
    ensure_clinic_access(&ctx, order.clinic_id, format!("Order {}", body.order_id))?;

    if order.status != OrderStatus::QueuedForProvider {
        return Err(Error::conflict(format!("Order already {}", order.status)));
    }
    if !provider.licensed_in(&order.ship_to_state) {
        return Err(Error::forbidden(format!(
            "Provider is not licensed in {}",
            order.ship_to_state
        )));
    }

    let assignment = store
        .claim_order(order.id, ctx.user_id)
        .await?
        .ok_or_else(|| Error::conflict("Order already claimed"))?;

    store
        .record_audit(&AuditRecord::new(
            order.clinic_id,
            ctx.user_id,
            "order",
            order.id,
            "claim",
            "claimed",
        ))
        .await?;
    tracing::info!(
        order_id = order.id,
        provider_id = ctx.user_id,
        "order claimed by provider"
    );

    Ok(Json(json!({ "success": true, "assignment": assignment })))
}
