use std::future::Future;

use crate::auth::RequestContext;
use crate::error::Result;
use crate::store::{Store, StoredResponse};

/// Resource tag for refill approvals.
pub const RESOURCE_REFILL_APPROVE: &str = "refill_approve";
/// Resource tag for order declines.
pub const RESOURCE_ORDER_DECLINE: &str = "order_decline";

/// At-most-once execution of a mutating operation under client retry.
///
/// With no key every call executes. With a key, a prior stored response for
/// the caller's `(key, resource)` is replayed verbatim instead of invoking
/// `f`; otherwise `f` runs and its response is persisted. The ledger key
/// carries the caller's clinic and user id, so a key replays only to the
/// caller who first used it, never another tenant. Failures are not
/// recorded, so a retry after an error executes again.
pub async fn with_idempotency<F, Fut>(
    store: &dyn Store,
    ctx: &RequestContext,
    key: Option<&str>,
    resource: &str,
    f: F,
) -> Result<StoredResponse>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse>>,
{
    let Some(key) = key else {
        return f().await;
    };
    let key = format!("{}/{}/{}", ctx.clinic_id, ctx.user_id, key);

    if let Some(stored) = store.idempotency_get(&key, resource).await? {
        tracing::debug!(key = %key, resource, "replaying stored idempotent response");
        return Ok(stored);
    }

    let response = f().await?;
    store.idempotency_put(&key, resource, &response).await?;
    Ok(response)
}
