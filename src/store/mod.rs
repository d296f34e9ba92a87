pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::models::order::{NewOrder, Order, OrderStatus, ProviderAssignment};
use crate::models::refill::{NewRefill, RefillEntry, RefillStatus};
use crate::models::routing::{Provider, RoutingConfig};
use crate::models::subscription::Subscription;
use crate::models::AuditRecord;

pub use memory::MemStore;
pub use postgres::PgStore;

/// Response captured for idempotent replay: the HTTP status and the exact
/// body the first execution produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: Value,
}

impl StoredResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }
}

impl axum::response::IntoResponse for StoredResponse {
    fn into_response(self) -> axum::response::Response {
        let status = axum::http::StatusCode::from_u16(self.status)
            .unwrap_or(axum::http::StatusCode::OK);
        (status, axum::Json(self.body)).into_response()
    }
}

/// A billing webhook event that failed processing and is parked for retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub clinic_id: i64,
    pub payload: Value,
    pub attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
}

/// Storage seam for the whole service. Every race-prone transition is a
/// single conditional update in the backing store; callers treat a `None`
/// return as a lost race or stale state.
#[async_trait]
pub trait Store: Send + Sync {
    // Clinics and routing.
    async fn clinic_ids(&self) -> Result<Vec<i64>>;
    async fn routing_config(&self, clinic_id: i64) -> Result<Option<RoutingConfig>>;
    async fn provider(&self, provider_id: i64) -> Result<Option<Provider>>;
    async fn providers_for_clinic(&self, clinic_id: i64) -> Result<Vec<Provider>>;

    // Subscriptions.
    async fn subscription(&self, id: i64) -> Result<Option<Subscription>>;
    async fn update_subscription(&self, sub: &Subscription) -> Result<()>;
    /// Active subscriptions whose next billing date is due at `as_of`.
    async fn due_subscriptions(
        &self,
        clinic_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Subscription>>;

    // Refill queue.
    async fn refill(&self, id: i64) -> Result<Option<RefillEntry>>;
    async fn refills_for_clinic(
        &self,
        clinic_id: i64,
        status: Option<RefillStatus>,
    ) -> Result<Vec<RefillEntry>>;
    /// All entries of a multi-shipment series, ordered by shipment number.
    async fn refill_series(&self, parent_refill_id: i64) -> Result<Vec<RefillEntry>>;
    async fn insert_refill(&self, new: NewRefill) -> Result<RefillEntry>;
    /// Any non-terminal entry already queued for the subscription.
    async fn open_refill_for_subscription(
        &self,
        subscription_id: i64,
    ) -> Result<Option<RefillEntry>>;
    /// Conditional: pending_payment -> pending_admin with payment verified.
    async fn verify_refill_payment(&self, id: i64) -> Result<Option<RefillEntry>>;
    /// Conditional: pending_admin with verified payment -> pending_provider,
    /// recording the approver. The fulfillment order is created in the same
    /// atomic step, so an approved entry always has an order to act on.
    /// `None` means the guard no longer holds.
    async fn approve_refill(
        &self,
        id: i64,
        approver_id: i64,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<(RefillEntry, Order)>>;
    /// Conditional transition from one of `from` into `to`.
    async fn transition_refill(
        &self,
        id: i64,
        from: &[RefillStatus],
        to: RefillStatus,
    ) -> Result<Option<RefillEntry>>;

    // Orders.
    async fn order(&self, id: i64) -> Result<Option<Order>>;
    async fn insert_order(&self, new: NewOrder) -> Result<Order>;
    /// Queued, unclaimed orders; optionally restricted to ship-to states.
    async fn unassigned_orders(
        &self,
        clinic_id: i64,
        states: Option<&[String]>,
    ) -> Result<Vec<Order>>;
    /// Queued orders already claimed by the provider.
    async fn orders_for_provider(&self, clinic_id: i64, provider_id: i64) -> Result<Vec<Order>>;
    async fn open_order_count(&self, provider_id: i64) -> Result<i64>;
    /// Conditional claim: only succeeds while the order is queued and
    /// unclaimed. The losing side of a race gets `None`.
    async fn claim_order(
        &self,
        order_id: i64,
        provider_id: i64,
    ) -> Result<Option<ProviderAssignment>>;
    /// Conditional close-out of a queued order (decline or complete). The
    /// source refill entry is closed in the same atomic step unless it has
    /// already moved on.
    async fn finish_order(
        &self,
        order_id: i64,
        to: OrderStatus,
        decline_reason: Option<&str>,
    ) -> Result<Option<Order>>;

    // Idempotency ledger. Records are write-once.
    async fn idempotency_get(&self, key: &str, resource: &str) -> Result<Option<StoredResponse>>;
    async fn idempotency_put(
        &self,
        key: &str,
        resource: &str,
        response: &StoredResponse,
    ) -> Result<()>;

    // Webhook dead letters.
    async fn enqueue_dead_letter(
        &self,
        clinic_id: i64,
        payload: &Value,
        error: &str,
    ) -> Result<()>;
    async fn undelivered_dead_letters(
        &self,
        clinic_id: i64,
        max_attempts: i32,
    ) -> Result<Vec<DeadLetter>>;
    async fn record_dead_letter_attempt(
        &self,
        id: Uuid,
        delivered: bool,
        error: Option<&str>,
    ) -> Result<()>;

    // Audit trail.
    async fn record_audit(&self, record: &AuditRecord) -> Result<()>;
}
