use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "paused" => Some(SubscriptionStatus::Paused),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recurring billing record, the source of truth for whether a patient is
/// due for a refill.
///
/// Invariants: `Canceled` is terminal, and `next_billing_date` is `Some`
/// exactly when the subscription is `Active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub patient_id: i64,
    pub clinic_id: i64,
    pub status: SubscriptionStatus,
    pub medication: String,
    pub ship_to_state: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_billing_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    fn reject_if_canceled(&self) -> Result<(), Error> {
        if self.status == SubscriptionStatus::Canceled {
            return Err(Error::conflict(format!(
                "Subscription {} is canceled and cannot change state",
                self.id
            )));
        }
        Ok(())
    }

    /// A successful charge opens a new billing period.
    pub fn record_payment(
        &mut self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.reject_if_canceled()?;
        self.status = SubscriptionStatus::Active;
        self.current_period_start = period_start;
        self.current_period_end = period_end;
        self.next_billing_date = Some(period_end);
        Ok(())
    }

    /// A failed charge pauses billing until the payment method is fixed.
    pub fn record_payment_failure(&mut self) -> Result<(), Error> {
        self.reject_if_canceled()?;
        self.status = SubscriptionStatus::Paused;
        self.next_billing_date = None;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), Error> {
        self.reject_if_canceled()?;
        self.status = SubscriptionStatus::Paused;
        self.next_billing_date = None;
        Ok(())
    }

    /// Resume billing; the next charge falls at the current period boundary.
    pub fn resume(&mut self) -> Result<(), Error> {
        self.reject_if_canceled()?;
        self.status = SubscriptionStatus::Active;
        self.next_billing_date = Some(self.current_period_end);
        Ok(())
    }

    /// Cancel is terminal. Canceling twice is a conflict.
    pub fn cancel(&mut self) -> Result<(), Error> {
        self.reject_if_canceled()?;
        self.status = SubscriptionStatus::Canceled;
        self.next_billing_date = None;
        Ok(())
    }
}

/// Billing events delivered by the payment gateway webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingEvent {
    /// A subscription charge settled; a new billing period begins.
    PaymentSucceeded {
        subscription_id: i64,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    },
    /// A subscription charge failed.
    PaymentFailed { subscription_id: i64 },
    /// The subscription was canceled at the gateway.
    SubscriptionCanceled { subscription_id: i64 },
    /// A one-off refill payment settled; the queue entry may advance to
    /// admin review.
    RefillPayment { refill_id: i64 },
}
