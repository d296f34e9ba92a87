use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::order::{NewOrder, Order, OrderStatus, ProviderAssignment};
use crate::models::refill::{NewRefill, RefillEntry, RefillStatus};
use crate::models::routing::{Provider, RoutingConfig, RoutingStrategy};
use crate::models::subscription::{Subscription, SubscriptionStatus};
use crate::models::AuditRecord;

use super::{DeadLetter, Store, StoredResponse};

/// Postgres-backed store. All conditional transitions are single UPDATE
/// statements whose WHERE clause encodes the guard; the row either comes
/// back via RETURNING or the caller learns it lost the race.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema when it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS clinics (
                id BIGINT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT ''
            )",
            "CREATE TABLE IF NOT EXISTS routing_configs (
                clinic_id BIGINT PRIMARY KEY REFERENCES clinics(id),
                routing_enabled BOOLEAN NOT NULL DEFAULT FALSE,
                strategy TEXT NOT NULL DEFAULT 'provider_choice'
            )",
            "CREATE TABLE IF NOT EXISTS providers (
                id BIGINT PRIMARY KEY,
                clinic_id BIGINT NOT NULL REFERENCES clinics(id),
                display_name TEXT NOT NULL,
                licensed_states TEXT[] NOT NULL DEFAULT '{}'
            )",
            "CREATE TABLE IF NOT EXISTS subscriptions (
                id BIGSERIAL PRIMARY KEY,
                patient_id BIGINT NOT NULL,
                clinic_id BIGINT NOT NULL,
                status TEXT NOT NULL,
                medication TEXT NOT NULL,
                ship_to_state TEXT NOT NULL,
                current_period_start TIMESTAMPTZ NOT NULL,
                current_period_end TIMESTAMPTZ NOT NULL,
                next_billing_date TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            "CREATE TABLE IF NOT EXISTS refill_queue (
                id BIGSERIAL PRIMARY KEY,
                patient_id BIGINT NOT NULL,
                clinic_id BIGINT NOT NULL,
                subscription_id BIGINT,
                status TEXT NOT NULL,
                payment_verified BOOLEAN NOT NULL DEFAULT FALSE,
                medication TEXT NOT NULL,
                ship_to_state TEXT NOT NULL,
                shipment_number INT NOT NULL DEFAULT 1,
                total_shipments INT NOT NULL DEFAULT 1,
                parent_refill_id BIGINT,
                approved_by BIGINT,
                approved_at TIMESTAMPTZ,
                notes TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            "CREATE TABLE IF NOT EXISTS orders (
                id BIGSERIAL PRIMARY KEY,
                refill_id BIGINT NOT NULL,
                patient_id BIGINT NOT NULL,
                clinic_id BIGINT NOT NULL,
                status TEXT NOT NULL,
                medication TEXT NOT NULL,
                ship_to_state TEXT NOT NULL,
                provider_id BIGINT,
                decline_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            "CREATE TABLE IF NOT EXISTS idempotency_records (
                key TEXT NOT NULL,
                resource TEXT NOT NULL,
                status INT NOT NULL,
                body JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (key, resource)
            )",
            "CREATE TABLE IF NOT EXISTS webhook_dead_letters (
                id UUID PRIMARY KEY,
                clinic_id BIGINT NOT NULL,
                payload JSONB NOT NULL,
                attempts INT NOT NULL DEFAULT 1,
                last_error TEXT,
                delivered BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            "CREATE TABLE IF NOT EXISTS audit_log (
                id UUID PRIMARY KEY,
                clinic_id BIGINT NOT NULL,
                actor_id BIGINT NOT NULL,
                entity TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                action TEXT NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT,
                at TIMESTAMPTZ NOT NULL
            )",
        ];

        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn parse_status<T>(raw: &str, parse: fn(&str) -> Option<T>, what: &str) -> Result<T> {
    parse(raw).ok_or_else(|| Error::Internal(anyhow::anyhow!("unknown {} in database: {}", what, raw)))
}

fn refill_from_row(row: &PgRow) -> Result<RefillEntry> {
    let status: String = row.get("status");
    Ok(RefillEntry {
        id: row.get("id"),
        patient_id: row.get("patient_id"),
        clinic_id: row.get("clinic_id"),
        subscription_id: row.get("subscription_id"),
        status: parse_status(&status, RefillStatus::parse, "refill status")?,
        payment_verified: row.get("payment_verified"),
        medication: row.get("medication"),
        ship_to_state: row.get("ship_to_state"),
        shipment_number: row.get("shipment_number"),
        total_shipments: row.get("total_shipments"),
        parent_refill_id: row.get("parent_refill_id"),
        approved_by: row.get("approved_by"),
        approved_at: row.get("approved_at"),
        notes: row.get("notes"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    let status: String = row.get("status");
    Ok(Order {
        id: row.get("id"),
        refill_id: row.get("refill_id"),
        patient_id: row.get("patient_id"),
        clinic_id: row.get("clinic_id"),
        status: parse_status(&status, OrderStatus::parse, "order status")?,
        medication: row.get("medication"),
        ship_to_state: row.get("ship_to_state"),
        provider_id: row.get("provider_id"),
        decline_reason: row.get("decline_reason"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription> {
    let status: String = row.get("status");
    Ok(Subscription {
        id: row.get("id"),
        patient_id: row.get("patient_id"),
        clinic_id: row.get("clinic_id"),
        status: parse_status(&status, SubscriptionStatus::parse, "subscription status")?,
        medication: row.get("medication"),
        ship_to_state: row.get("ship_to_state"),
        current_period_start: row.get("current_period_start"),
        current_period_end: row.get("current_period_end"),
        next_billing_date: row.get("next_billing_date"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn provider_from_row(row: &PgRow) -> Provider {
    Provider {
        id: row.get("id"),
        clinic_id: row.get("clinic_id"),
        display_name: row.get("display_name"),
        licensed_states: row.get("licensed_states"),
    }
}

const REFILL_COLUMNS: &str = "id, patient_id, clinic_id, subscription_id, status, \
    payment_verified, medication, ship_to_state, shipment_number, total_shipments, \
    parent_refill_id, approved_by, approved_at, notes, created_at, updated_at";

const ORDER_COLUMNS: &str = "id, refill_id, patient_id, clinic_id, status, medication, \
    ship_to_state, provider_id, decline_reason, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, patient_id, clinic_id, status, medication, \
    ship_to_state, current_period_start, current_period_end, next_billing_date, \
    created_at, updated_at";

#[async_trait]
impl Store for PgStore {
    async fn clinic_ids(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM clinics ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn routing_config(&self, clinic_id: i64) -> Result<Option<RoutingConfig>> {
        let row = sqlx::query(
            "SELECT clinic_id, routing_enabled, strategy FROM routing_configs WHERE clinic_id = $1",
        )
        .bind(clinic_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let strategy: String = row.get("strategy");
            Ok(RoutingConfig {
                clinic_id: row.get("clinic_id"),
                routing_enabled: row.get("routing_enabled"),
                strategy: parse_status(&strategy, RoutingStrategy::parse, "routing strategy")?,
            })
        })
        .transpose()
    }

    async fn provider(&self, provider_id: i64) -> Result<Option<Provider>> {
        let row = sqlx::query(
            "SELECT id, clinic_id, display_name, licensed_states FROM providers WHERE id = $1",
        )
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| provider_from_row(&r)))
    }

    async fn providers_for_clinic(&self, clinic_id: i64) -> Result<Vec<Provider>> {
        let rows = sqlx::query(
            "SELECT id, clinic_id, display_name, licensed_states
             FROM providers WHERE clinic_id = $1 ORDER BY id",
        )
        .bind(clinic_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(provider_from_row).collect())
    }

    async fn subscription(&self, id: i64) -> Result<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn update_subscription(&self, sub: &Subscription) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions
             SET status = $2, current_period_start = $3, current_period_end = $4,
                 next_billing_date = $5, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(sub.id)
        .bind(sub.status.as_str())
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.next_billing_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_subscriptions(
        &self,
        clinic_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM subscriptions
             WHERE clinic_id = $1 AND status = 'active' AND next_billing_date <= $2
             ORDER BY id",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(clinic_id)
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn refill(&self, id: i64) -> Result<Option<RefillEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM refill_queue WHERE id = $1",
            REFILL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(refill_from_row).transpose()
    }

    async fn refills_for_clinic(
        &self,
        clinic_id: i64,
        status: Option<RefillStatus>,
    ) -> Result<Vec<RefillEntry>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM refill_queue WHERE clinic_id = $1 AND status = $2 ORDER BY id",
                    REFILL_COLUMNS
                ))
                .bind(clinic_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM refill_queue WHERE clinic_id = $1 ORDER BY id",
                    REFILL_COLUMNS
                ))
                .bind(clinic_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(refill_from_row).collect()
    }

    async fn refill_series(&self, parent_refill_id: i64) -> Result<Vec<RefillEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM refill_queue
             WHERE parent_refill_id = $1 OR id = $1
             ORDER BY shipment_number",
            REFILL_COLUMNS
        ))
        .bind(parent_refill_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(refill_from_row).collect()
    }

    async fn insert_refill(&self, new: NewRefill) -> Result<RefillEntry> {
        let row = sqlx::query(&format!(
            "INSERT INTO refill_queue
                (patient_id, clinic_id, subscription_id, status, payment_verified,
                 medication, ship_to_state, shipment_number, total_shipments, parent_refill_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING {}",
            REFILL_COLUMNS
        ))
        .bind(new.patient_id)
        .bind(new.clinic_id)
        .bind(new.subscription_id)
        .bind(new.status.as_str())
        .bind(new.payment_verified)
        .bind(&new.medication)
        .bind(&new.ship_to_state)
        .bind(new.shipment_number)
        .bind(new.total_shipments)
        .bind(new.parent_refill_id)
        .fetch_one(&self.pool)
        .await?;
        refill_from_row(&row)
    }

    async fn open_refill_for_subscription(
        &self,
        subscription_id: i64,
    ) -> Result<Option<RefillEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM refill_queue
             WHERE subscription_id = $1
               AND status NOT IN ('completed', 'declined', 'cancelled')
             LIMIT 1",
            REFILL_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(refill_from_row).transpose()
    }

    async fn verify_refill_payment(&self, id: i64) -> Result<Option<RefillEntry>> {
        let row = sqlx::query(&format!(
            "UPDATE refill_queue
             SET status = 'pending_admin', payment_verified = TRUE, updated_at = NOW()
             WHERE id = $1 AND status = 'pending_payment'
             RETURNING {}",
            REFILL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(refill_from_row).transpose()
    }

    async fn approve_refill(
        &self,
        id: i64,
        approver_id: i64,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<(RefillEntry, Order)>> {
        // One transaction: the entry must never sit in pending_provider
        // without an order for a provider to pick up.
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE refill_queue
             SET status = 'pending_provider', approved_by = $2, approved_at = $3,
                 notes = $4, updated_at = $3
             WHERE id = $1 AND status = 'pending_admin' AND payment_verified
             RETURNING {}",
            REFILL_COLUMNS
        ))
        .bind(id)
        .bind(approver_id)
        .bind(at)
        .bind(notes)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let entry = refill_from_row(&row)?;

        let row = sqlx::query(&format!(
            "INSERT INTO orders (refill_id, patient_id, clinic_id, status, medication, ship_to_state)
             VALUES ($1, $2, $3, 'queued_for_provider', $4, $5)
             RETURNING {}",
            ORDER_COLUMNS
        ))
        .bind(entry.id)
        .bind(entry.patient_id)
        .bind(entry.clinic_id)
        .bind(&entry.medication)
        .bind(&entry.ship_to_state)
        .fetch_one(&mut *tx)
        .await?;
        let order = order_from_row(&row)?;

        tx.commit().await?;
        Ok(Some((entry, order)))
    }

    async fn transition_refill(
        &self,
        id: i64,
        from: &[RefillStatus],
        to: RefillStatus,
    ) -> Result<Option<RefillEntry>> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let row = sqlx::query(&format!(
            "UPDATE refill_queue
             SET status = $3, updated_at = NOW()
             WHERE id = $1 AND status = ANY($2)
             RETURNING {}",
            REFILL_COLUMNS
        ))
        .bind(id)
        .bind(&from)
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(refill_from_row).transpose()
    }

    async fn order(&self, id: i64) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn insert_order(&self, new: NewOrder) -> Result<Order> {
        let row = sqlx::query(&format!(
            "INSERT INTO orders (refill_id, patient_id, clinic_id, status, medication, ship_to_state)
             VALUES ($1, $2, $3, 'queued_for_provider', $4, $5)
             RETURNING {}",
            ORDER_COLUMNS
        ))
        .bind(new.refill_id)
        .bind(new.patient_id)
        .bind(new.clinic_id)
        .bind(&new.medication)
        .bind(&new.ship_to_state)
        .fetch_one(&self.pool)
        .await?;
        order_from_row(&row)
    }

    async fn unassigned_orders(
        &self,
        clinic_id: i64,
        states: Option<&[String]>,
    ) -> Result<Vec<Order>> {
        let rows = match states {
            Some(states) => {
                sqlx::query(&format!(
                    "SELECT {} FROM orders
                     WHERE clinic_id = $1 AND status = 'queued_for_provider'
                       AND provider_id IS NULL AND ship_to_state = ANY($2)
                     ORDER BY id",
                    ORDER_COLUMNS
                ))
                .bind(clinic_id)
                .bind(states)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM orders
                     WHERE clinic_id = $1 AND status = 'queued_for_provider'
                       AND provider_id IS NULL
                     ORDER BY id",
                    ORDER_COLUMNS
                ))
                .bind(clinic_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(order_from_row).collect()
    }

    async fn orders_for_provider(&self, clinic_id: i64, provider_id: i64) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders
             WHERE clinic_id = $1 AND provider_id = $2 AND status = 'queued_for_provider'
             ORDER BY id",
            ORDER_COLUMNS
        ))
        .bind(clinic_id)
        .bind(provider_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn open_order_count(&self, provider_id: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM orders
             WHERE provider_id = $1 AND status = 'queued_for_provider'",
        )
        .bind(provider_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("count"))
    }

    async fn claim_order(
        &self,
        order_id: i64,
        provider_id: i64,
    ) -> Result<Option<ProviderAssignment>> {
        // The WHERE clause is the whole race story: only one concurrent
        // update can match the unclaimed row.
        let row = sqlx::query(
            "UPDATE orders
             SET provider_id = $2, updated_at = NOW()
             WHERE id = $1 AND provider_id IS NULL AND status = 'queued_for_provider'
             RETURNING updated_at",
        )
        .bind(order_id)
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ProviderAssignment {
            order_id,
            provider_id,
            assigned_at: r.get("updated_at"),
        }))
    }

    async fn finish_order(
        &self,
        order_id: i64,
        to: OrderStatus,
        decline_reason: Option<&str>,
    ) -> Result<Option<Order>> {
        let (refill_from, refill_to): (Vec<&str>, &str) = match to {
            OrderStatus::Declined => (
                vec!["pending_payment", "pending_admin", "pending_provider"],
                "declined",
            ),
            OrderStatus::Completed => (vec!["pending_provider"], "completed"),
            OrderStatus::QueuedForProvider => {
                return Err(Error::Internal(anyhow::anyhow!(
                    "finish_order cannot requeue an order"
                )));
            }
        };

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE orders
             SET status = $2, decline_reason = $3, updated_at = NOW()
             WHERE id = $1 AND status = 'queued_for_provider'
             RETURNING {}",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .bind(to.as_str())
        .bind(decline_reason)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let order = order_from_row(&row)?;

        // Close the source refill in the same transaction; if it already
        // moved on, leave it be.
        sqlx::query(
            "UPDATE refill_queue
             SET status = $2, updated_at = NOW()
             WHERE id = $1 AND status = ANY($3)",
        )
        .bind(order.refill_id)
        .bind(refill_to)
        .bind(&refill_from)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(order))
    }

    async fn idempotency_get(&self, key: &str, resource: &str) -> Result<Option<StoredResponse>> {
        let row = sqlx::query(
            "SELECT status, body FROM idempotency_records WHERE key = $1 AND resource = $2",
        )
        .bind(key)
        .bind(resource)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let status: i32 = r.get("status");
            StoredResponse {
                status: status as u16,
                body: r.get("body"),
            }
        }))
    }

    async fn idempotency_put(
        &self,
        key: &str,
        resource: &str,
        response: &StoredResponse,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO idempotency_records (key, resource, status, body)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (key, resource) DO NOTHING",
        )
        .bind(key)
        .bind(resource)
        .bind(response.status as i32)
        .bind(&response.body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enqueue_dead_letter(
        &self,
        clinic_id: i64,
        payload: &Value,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO webhook_dead_letters (id, clinic_id, payload, attempts, last_error)
             VALUES ($1, $2, $3, 1, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(clinic_id)
        .bind(payload)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn undelivered_dead_letters(
        &self,
        clinic_id: i64,
        max_attempts: i32,
    ) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT id, clinic_id, payload, attempts, last_error, delivered, created_at
             FROM webhook_dead_letters
             WHERE clinic_id = $1 AND NOT delivered AND attempts < $2
             ORDER BY created_at",
        )
        .bind(clinic_id)
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| DeadLetter {
                id: r.get("id"),
                clinic_id: r.get("clinic_id"),
                payload: r.get("payload"),
                attempts: r.get("attempts"),
                last_error: r.get("last_error"),
                delivered: r.get("delivered"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn record_dead_letter_attempt(
        &self,
        id: Uuid,
        delivered: bool,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_dead_letters
             SET attempts = attempts + 1, delivered = $2, last_error = $3
             WHERE id = $1",
        )
        .bind(id)
        .bind(delivered)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_audit(&self, record: &AuditRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log
                (id, clinic_id, actor_id, entity, entity_id, action, outcome, detail, at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(record.id)
        .bind(record.clinic_id)
        .bind(record.actor_id)
        .bind(&record.entity)
        .bind(&record.entity_id)
        .bind(&record.action)
        .bind(&record.outcome)
        .bind(&record.detail)
        .bind(record.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
