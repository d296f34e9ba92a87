use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prescription order status. Orders exist from admin approval onwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    QueuedForProvider,
    Declined,
    Completed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::QueuedForProvider => "queued_for_provider",
            OrderStatus::Declined => "declined",
            OrderStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued_for_provider" => Some(OrderStatus::QueuedForProvider),
            "declined" => Some(OrderStatus::Declined),
            "completed" => Some(OrderStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fulfillment record created once a refill clears the admin gate. A
/// provider claims (or is assigned) the order and then issues or declines
/// the prescription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub refill_id: i64,
    pub patient_id: i64,
    pub clinic_id: i64,
    pub status: OrderStatus,
    pub medication: String,
    pub ship_to_state: String,
    /// At most one active provider assignment per order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decline_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New order, before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub refill_id: i64,
    pub patient_id: i64,
    pub clinic_id: i64,
    pub medication: String,
    pub ship_to_state: String,
}

/// Result of a successful claim or auto-assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAssignment {
    pub order_id: i64,
    pub provider_id: i64,
    pub assigned_at: DateTime<Utc>,
}
