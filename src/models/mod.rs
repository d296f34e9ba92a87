pub mod audit;
pub mod order;
pub mod refill;
pub mod routing;
pub mod subscription;

pub use audit::AuditRecord;
pub use order::{Order, OrderStatus, ProviderAssignment};
pub use refill::{RefillEntry, RefillStatus};
pub use routing::{Provider, RoutingConfig, RoutingStrategy};
pub use subscription::{BillingEvent, Subscription, SubscriptionStatus};
