use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

/// Refill queue status. The status string is the single source of truth for
/// how far an entry has progressed; "approved" is derived from it rather
/// than tracked as a separate flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefillStatus {
    PendingPayment,
    PendingAdmin,
    PendingProvider,
    Completed,
    Declined,
    Cancelled,
}

impl RefillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefillStatus::PendingPayment => "pending_payment",
            RefillStatus::PendingAdmin => "pending_admin",
            RefillStatus::PendingProvider => "pending_provider",
            RefillStatus::Completed => "completed",
            RefillStatus::Declined => "declined",
            RefillStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_payment" => Some(RefillStatus::PendingPayment),
            "pending_admin" => Some(RefillStatus::PendingAdmin),
            "pending_provider" => Some(RefillStatus::PendingProvider),
            "completed" => Some(RefillStatus::Completed),
            "declined" => Some(RefillStatus::Declined),
            "cancelled" => Some(RefillStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RefillStatus::Completed | RefillStatus::Declined | RefillStatus::Cancelled
        )
    }

    /// The transition graph: payment -> admin -> provider -> completed, with
    /// declined/cancelled reachable from any non-terminal status.
    pub fn can_transition_to(&self, next: RefillStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            RefillStatus::Declined | RefillStatus::Cancelled => true,
            RefillStatus::PendingAdmin => *self == RefillStatus::PendingPayment,
            RefillStatus::PendingProvider => *self == RefillStatus::PendingAdmin,
            RefillStatus::Completed => *self == RefillStatus::PendingProvider,
            RefillStatus::PendingPayment => false,
        }
    }
}

impl fmt::Display for RefillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of recurring-prescription work moving through the
/// payment -> admin -> provider pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefillEntry {
    pub id: i64,
    pub patient_id: i64,
    pub clinic_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<i64>,
    pub status: RefillStatus,
    pub payment_verified: bool,
    pub medication: String,
    pub ship_to_state: String,
    /// Position within a multi-month series, 1-based.
    pub shipment_number: i32,
    pub total_shipments: i32,
    /// Entries of the same series share the first entry's id here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_refill_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RefillEntry {
    /// Derived: an entry is admin-approved once it has moved past the admin
    /// gate. There is no independently mutable boolean to drift.
    pub fn admin_approved(&self) -> bool {
        matches!(
            self.status,
            RefillStatus::PendingProvider | RefillStatus::Completed
        )
    }
}

/// New refill entry, before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewRefill {
    pub patient_id: i64,
    pub clinic_id: i64,
    pub subscription_id: Option<i64>,
    pub status: RefillStatus,
    pub payment_verified: bool,
    pub medication: String,
    pub ship_to_state: String,
    pub shipment_number: i32,
    pub total_shipments: i32,
    pub parent_refill_id: Option<i64>,
}

/// Admin-approval preconditions, checked in a fixed order so every failure
/// has a distinct, stable reason. Existence, tenancy, and role are the
/// caller's responsibility; this guard covers the entry's own state.
pub fn approval_guard(entry: &RefillEntry) -> Result<(), Error> {
    if entry.status == RefillStatus::PendingProvider {
        return Err(Error::validation("Refill already approved"));
    }
    if entry.status.is_terminal() {
        return Err(Error::conflict(format!("Refill already {}", entry.status)));
    }
    if entry.status != RefillStatus::PendingAdmin {
        return Err(Error::validation(format!(
            "Refill is not awaiting admin review (status: {})",
            entry.status
        )));
    }
    if !entry.payment_verified {
        return Err(Error::validation("Refill payment has not been verified"));
    }
    Ok(())
}
