use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::order::{NewOrder, Order, OrderStatus, ProviderAssignment};
use crate::models::refill::{NewRefill, RefillEntry, RefillStatus};
use crate::models::routing::{Provider, RoutingConfig};
use crate::models::subscription::{Subscription, SubscriptionStatus};
use crate::models::AuditRecord;

use super::{DeadLetter, Store, StoredResponse};

#[derive(Default)]
struct Inner {
    clinics: BTreeSet<i64>,
    routing: HashMap<i64, RoutingConfig>,
    providers: HashMap<i64, Provider>,
    subscriptions: BTreeMap<i64, Subscription>,
    refills: BTreeMap<i64, RefillEntry>,
    orders: BTreeMap<i64, Order>,
    idempotency: HashMap<(String, String), StoredResponse>,
    dead_letters: Vec<DeadLetter>,
    audit: Vec<AuditRecord>,
    next_refill_id: i64,
    next_order_id: i64,
}

/// Map-backed store with the same conditional-update semantics as the
/// Postgres implementation. The whole state sits behind one mutex, which is
/// what makes claim/approve races resolve to exactly one winner here too.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a clinic with its routing configuration.
    pub fn seed_clinic(&self, config: RoutingConfig) {
        let mut inner = self.lock();
        inner.clinics.insert(config.clinic_id);
        inner.routing.insert(config.clinic_id, config);
    }

    pub fn seed_provider(&self, provider: Provider) {
        let mut inner = self.lock();
        inner.clinics.insert(provider.clinic_id);
        inner.providers.insert(provider.id, provider);
    }

    /// Insert or replace a subscription under its own id.
    pub fn seed_subscription(&self, sub: Subscription) {
        let mut inner = self.lock();
        inner.clinics.insert(sub.clinic_id);
        inner.subscriptions.insert(sub.id, sub);
    }

    /// Test/inspection hook: the audit records written so far.
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.lock().audit.clone()
    }

    /// Test/inspection hook: parked webhook events.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn clinic_ids(&self) -> Result<Vec<i64>> {
        Ok(self.lock().clinics.iter().copied().collect())
    }

    async fn routing_config(&self, clinic_id: i64) -> Result<Option<RoutingConfig>> {
        Ok(self.lock().routing.get(&clinic_id).cloned())
    }

    async fn provider(&self, provider_id: i64) -> Result<Option<Provider>> {
        Ok(self.lock().providers.get(&provider_id).cloned())
    }

    async fn providers_for_clinic(&self, clinic_id: i64) -> Result<Vec<Provider>> {
        let inner = self.lock();
        let mut providers: Vec<Provider> = inner
            .providers
            .values()
            .filter(|p| p.clinic_id == clinic_id)
            .cloned()
            .collect();
        providers.sort_by_key(|p| p.id);
        Ok(providers)
    }

    async fn subscription(&self, id: i64) -> Result<Option<Subscription>> {
        Ok(self.lock().subscriptions.get(&id).cloned())
    }

    async fn update_subscription(&self, sub: &Subscription) -> Result<()> {
        let mut updated = sub.clone();
        updated.updated_at = Utc::now();
        self.lock().subscriptions.insert(updated.id, updated);
        Ok(())
    }

    async fn due_subscriptions(
        &self,
        clinic_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .filter(|s| {
                s.clinic_id == clinic_id
                    && s.status == SubscriptionStatus::Active
                    && s.next_billing_date.map(|d| d <= as_of).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn refill(&self, id: i64) -> Result<Option<RefillEntry>> {
        Ok(self.lock().refills.get(&id).cloned())
    }

    async fn refills_for_clinic(
        &self,
        clinic_id: i64,
        status: Option<RefillStatus>,
    ) -> Result<Vec<RefillEntry>> {
        Ok(self
            .lock()
            .refills
            .values()
            .filter(|r| r.clinic_id == clinic_id && status.map(|s| r.status == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn refill_series(&self, parent_refill_id: i64) -> Result<Vec<RefillEntry>> {
        let inner = self.lock();
        let mut series: Vec<RefillEntry> = inner
            .refills
            .values()
            .filter(|r| r.parent_refill_id == Some(parent_refill_id) || r.id == parent_refill_id)
            .cloned()
            .collect();
        series.sort_by_key(|r| r.shipment_number);
        Ok(series)
    }

    async fn insert_refill(&self, new: NewRefill) -> Result<RefillEntry> {
        let mut inner = self.lock();
        inner.next_refill_id += 1;
        let now = Utc::now();
        let entry = RefillEntry {
            id: inner.next_refill_id,
            patient_id: new.patient_id,
            clinic_id: new.clinic_id,
            subscription_id: new.subscription_id,
            status: new.status,
            payment_verified: new.payment_verified,
            medication: new.medication,
            ship_to_state: new.ship_to_state,
            shipment_number: new.shipment_number,
            total_shipments: new.total_shipments,
            parent_refill_id: new.parent_refill_id,
            approved_by: None,
            approved_at: None,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        inner.clinics.insert(entry.clinic_id);
        inner.refills.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn open_refill_for_subscription(
        &self,
        subscription_id: i64,
    ) -> Result<Option<RefillEntry>> {
        Ok(self
            .lock()
            .refills
            .values()
            .find(|r| r.subscription_id == Some(subscription_id) && !r.status.is_terminal())
            .cloned())
    }

    async fn verify_refill_payment(&self, id: i64) -> Result<Option<RefillEntry>> {
        let mut inner = self.lock();
        match inner.refills.get_mut(&id) {
            Some(entry) if entry.status == RefillStatus::PendingPayment => {
                entry.payment_verified = true;
                entry.status = RefillStatus::PendingAdmin;
                entry.updated_at = Utc::now();
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn approve_refill(
        &self,
        id: i64,
        approver_id: i64,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<(RefillEntry, Order)>> {
        // One critical section: the entry and its order appear together.
        let mut inner = self.lock();
        let entry = match inner.refills.get_mut(&id) {
            Some(entry)
                if entry.status == RefillStatus::PendingAdmin && entry.payment_verified =>
            {
                entry.status = RefillStatus::PendingProvider;
                entry.approved_by = Some(approver_id);
                entry.approved_at = Some(at);
                entry.notes = notes.map(|n| n.to_string());
                entry.updated_at = at;
                entry.clone()
            }
            _ => return Ok(None),
        };

        inner.next_order_id += 1;
        let order = Order {
            id: inner.next_order_id,
            refill_id: entry.id,
            patient_id: entry.patient_id,
            clinic_id: entry.clinic_id,
            status: OrderStatus::QueuedForProvider,
            medication: entry.medication.clone(),
            ship_to_state: entry.ship_to_state.clone(),
            provider_id: None,
            decline_reason: None,
            created_at: at,
            updated_at: at,
        };
        inner.orders.insert(order.id, order.clone());
        Ok(Some((entry, order)))
    }

    async fn transition_refill(
        &self,
        id: i64,
        from: &[RefillStatus],
        to: RefillStatus,
    ) -> Result<Option<RefillEntry>> {
        let mut inner = self.lock();
        match inner.refills.get_mut(&id) {
            Some(entry) if from.contains(&entry.status) => {
                entry.status = to;
                entry.updated_at = Utc::now();
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn order(&self, id: i64) -> Result<Option<Order>> {
        Ok(self.lock().orders.get(&id).cloned())
    }

    async fn insert_order(&self, new: NewOrder) -> Result<Order> {
        let mut inner = self.lock();
        inner.next_order_id += 1;
        let now = Utc::now();
        let order = Order {
            id: inner.next_order_id,
            refill_id: new.refill_id,
            patient_id: new.patient_id,
            clinic_id: new.clinic_id,
            status: OrderStatus::QueuedForProvider,
            medication: new.medication,
            ship_to_state: new.ship_to_state,
            provider_id: None,
            decline_reason: None,
            created_at: now,
            updated_at: now,
        };
        inner.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn unassigned_orders(
        &self,
        clinic_id: i64,
        states: Option<&[String]>,
    ) -> Result<Vec<Order>> {
        Ok(self
            .lock()
            .orders
            .values()
            .filter(|o| {
                o.clinic_id == clinic_id
                    && o.status == OrderStatus::QueuedForProvider
                    && o.provider_id.is_none()
                    && states
                        .map(|s| s.contains(&o.ship_to_state))
                        .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn orders_for_provider(&self, clinic_id: i64, provider_id: i64) -> Result<Vec<Order>> {
        Ok(self
            .lock()
            .orders
            .values()
            .filter(|o| {
                o.clinic_id == clinic_id
                    && o.provider_id == Some(provider_id)
                    && o.status == OrderStatus::QueuedForProvider
            })
            .cloned()
            .collect())
    }

    async fn open_order_count(&self, provider_id: i64) -> Result<i64> {
        Ok(self
            .lock()
            .orders
            .values()
            .filter(|o| {
                o.provider_id == Some(provider_id) && o.status == OrderStatus::QueuedForProvider
            })
            .count() as i64)
    }

    async fn claim_order(
        &self,
        order_id: i64,
        provider_id: i64,
    ) -> Result<Option<ProviderAssignment>> {
        let mut inner = self.lock();
        match inner.orders.get_mut(&order_id) {
            Some(order)
                if order.provider_id.is_none()
                    && order.status == OrderStatus::QueuedForProvider =>
            {
                let now = Utc::now();
                order.provider_id = Some(provider_id);
                order.updated_at = now;
                Ok(Some(ProviderAssignment {
                    order_id,
                    provider_id,
                    assigned_at: now,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn finish_order(
        &self,
        order_id: i64,
        to: OrderStatus,
        decline_reason: Option<&str>,
    ) -> Result<Option<Order>> {
        let (refill_from, refill_to): (&[RefillStatus], RefillStatus) = match to {
            OrderStatus::Declined => (
                &[
                    RefillStatus::PendingPayment,
                    RefillStatus::PendingAdmin,
                    RefillStatus::PendingProvider,
                ],
                RefillStatus::Declined,
            ),
            OrderStatus::Completed => (&[RefillStatus::PendingProvider], RefillStatus::Completed),
            OrderStatus::QueuedForProvider => {
                return Err(Error::Internal(anyhow::anyhow!(
                    "finish_order cannot requeue an order"
                )));
            }
        };

        let mut inner = self.lock();
        let order = match inner.orders.get_mut(&order_id) {
            Some(order) if order.status == OrderStatus::QueuedForProvider => {
                order.status = to;
                order.decline_reason = decline_reason.map(|r| r.to_string());
                order.updated_at = Utc::now();
                order.clone()
            }
            _ => return Ok(None),
        };

        // Close the source refill in the same critical section; if it
        // already moved on, leave it be.
        if let Some(entry) = inner.refills.get_mut(&order.refill_id) {
            if refill_from.contains(&entry.status) {
                entry.status = refill_to;
                entry.updated_at = Utc::now();
            }
        }
        Ok(Some(order))
    }

    async fn idempotency_get(&self, key: &str, resource: &str) -> Result<Option<StoredResponse>> {
        Ok(self
            .lock()
            .idempotency
            .get(&(key.to_string(), resource.to_string()))
            .cloned())
    }

    async fn idempotency_put(
        &self,
        key: &str,
        resource: &str,
        response: &StoredResponse,
    ) -> Result<()> {
        self.lock()
            .idempotency
            .entry((key.to_string(), resource.to_string()))
            .or_insert_with(|| response.clone());
        Ok(())
    }

    async fn enqueue_dead_letter(
        &self,
        clinic_id: i64,
        payload: &Value,
        error: &str,
    ) -> Result<()> {
        self.lock().dead_letters.push(DeadLetter {
            id: Uuid::new_v4(),
            clinic_id,
            payload: payload.clone(),
            attempts: 1,
            last_error: Some(error.to_string()),
            delivered: false,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn undelivered_dead_letters(
        &self,
        clinic_id: i64,
        max_attempts: i32,
    ) -> Result<Vec<DeadLetter>> {
        Ok(self
            .lock()
            .dead_letters
            .iter()
            .filter(|d| d.clinic_id == clinic_id && !d.delivered && d.attempts < max_attempts)
            .cloned()
            .collect())
    }

    async fn record_dead_letter_attempt(
        &self,
        id: Uuid,
        delivered: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.lock();
        if let Some(dl) = inner.dead_letters.iter_mut().find(|d| d.id == id) {
            dl.attempts += 1;
            dl.delivered = delivered;
            dl.last_error = error.map(|e| e.to_string());
        }
        Ok(())
    }

    async fn record_audit(&self, record: &AuditRecord) -> Result<()> {
        self.lock().audit.push(record.clone());
        Ok(())
    }
}

/// Test double wrapping a `MemStore` and failing selected operations with an
/// internal error, so failure-isolation behavior can be exercised.
#[cfg(test)]
pub struct FailingStore {
    pub inner: MemStore,
    pub fail_due_for: Option<i64>,
    pub fail_subscriptions: bool,
    pub fail_subscription_updates: bool,
}

#[cfg(test)]
impl FailingStore {
    pub fn new(inner: MemStore) -> Self {
        Self {
            inner,
            fail_due_for: None,
            fail_subscriptions: false,
            fail_subscription_updates: false,
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Store for FailingStore {
    async fn clinic_ids(&self) -> Result<Vec<i64>> {
        self.inner.clinic_ids().await
    }
    async fn routing_config(&self, clinic_id: i64) -> Result<Option<RoutingConfig>> {
        self.inner.routing_config(clinic_id).await
    }
    async fn provider(&self, provider_id: i64) -> Result<Option<Provider>> {
        self.inner.provider(provider_id).await
    }
    async fn providers_for_clinic(&self, clinic_id: i64) -> Result<Vec<Provider>> {
        self.inner.providers_for_clinic(clinic_id).await
    }
    async fn subscription(&self, id: i64) -> Result<Option<Subscription>> {
        if self.fail_subscriptions {
            return Err(Error::Internal(anyhow::anyhow!("connection reset")));
        }
        self.inner.subscription(id).await
    }
    async fn update_subscription(&self, sub: &Subscription) -> Result<()> {
        if self.fail_subscription_updates {
            return Err(Error::Internal(anyhow::anyhow!("connection reset")));
        }
        self.inner.update_subscription(sub).await
    }
    async fn due_subscriptions(
        &self,
        clinic_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        if self.fail_due_for == Some(clinic_id) {
            return Err(Error::Internal(anyhow::anyhow!("connection reset")));
        }
        self.inner.due_subscriptions(clinic_id, as_of).await
    }
    async fn refill(&self, id: i64) -> Result<Option<RefillEntry>> {
        self.inner.refill(id).await
    }
    async fn refills_for_clinic(
        &self,
        clinic_id: i64,
        status: Option<RefillStatus>,
    ) -> Result<Vec<RefillEntry>> {
        self.inner.refills_for_clinic(clinic_id, status).await
    }
    async fn refill_series(&self, parent_refill_id: i64) -> Result<Vec<RefillEntry>> {
        self.inner.refill_series(parent_refill_id).await
    }
    async fn insert_refill(&self, new: NewRefill) -> Result<RefillEntry> {
        self.inner.insert_refill(new).await
    }
    async fn open_refill_for_subscription(
        &self,
        subscription_id: i64,
    ) -> Result<Option<RefillEntry>> {
        self.inner.open_refill_for_subscription(subscription_id).await
    }
    async fn verify_refill_payment(&self, id: i64) -> Result<Option<RefillEntry>> {
        self.inner.verify_refill_payment(id).await
    }
    async fn approve_refill(
        &self,
        id: i64,
        approver_id: i64,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<(RefillEntry, Order)>> {
        self.inner.approve_refill(id, approver_id, notes, at).await
    }
    async fn transition_refill(
        &self,
        id: i64,
        from: &[RefillStatus],
        to: RefillStatus,
    ) -> Result<Option<RefillEntry>> {
        self.inner.transition_refill(id, from, to).await
    }
    async fn order(&self, id: i64) -> Result<Option<Order>> {
        self.inner.order(id).await
    }
    async fn insert_order(&self, new: NewOrder) -> Result<Order> {
        self.inner.insert_order(new).await
    }
    async fn unassigned_orders(
        &self,
        clinic_id: i64,
        states: Option<&[String]>,
    ) -> Result<Vec<Order>> {
        self.inner.unassigned_orders(clinic_id, states).await
    }
    async fn orders_for_provider(&self, clinic_id: i64, provider_id: i64) -> Result<Vec<Order>> {
        self.inner.orders_for_provider(clinic_id, provider_id).await
    }
    async fn open_order_count(&self, provider_id: i64) -> Result<i64> {
        self.inner.open_order_count(provider_id).await
    }
    async fn claim_order(
        &self,
        order_id: i64,
        provider_id: i64,
    ) -> Result<Option<ProviderAssignment>> {
        self.inner.claim_order(order_id, provider_id).await
    }
    async fn finish_order(
        &self,
        order_id: i64,
        to: OrderStatus,
        decline_reason: Option<&str>,
    ) -> Result<Option<Order>> {
        self.inner.finish_order(order_id, to, decline_reason).await
    }
    async fn idempotency_get(&self, key: &str, resource: &str) -> Result<Option<StoredResponse>> {
        self.inner.idempotency_get(key, resource).await
    }
    async fn idempotency_put(
        &self,
        key: &str,
        resource: &str,
        response: &StoredResponse,
    ) -> Result<()> {
        self.inner.idempotency_put(key, resource, response).await
    }
    async fn enqueue_dead_letter(
        &self,
        clinic_id: i64,
        payload: &Value,
        error: &str,
    ) -> Result<()> {
        self.inner.enqueue_dead_letter(clinic_id, payload, error).await
    }
    async fn undelivered_dead_letters(
        &self,
        clinic_id: i64,
        max_attempts: i32,
    ) -> Result<Vec<DeadLetter>> {
        self.inner
            .undelivered_dead_letters(clinic_id, max_attempts)
            .await
    }
    async fn record_dead_letter_attempt(
        &self,
        id: Uuid,
        delivered: bool,
        error: Option<&str>,
    ) -> Result<()> {
        self.inner
            .record_dead_letter_attempt(id, delivered, error)
            .await
    }
    async fn record_audit(&self, record: &AuditRecord) -> Result<()> {
        self.inner.record_audit(record).await
    }
}
