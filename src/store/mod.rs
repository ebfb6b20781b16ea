//! Persistence seam for the engine.
//!
//! Implementations must make `insert_alert` the serialization point for
//! `(customer_id, alert_type)`: at most one open alert per pair, with the
//! losing writer receiving [`EngineError::Conflict`](crate::error::EngineError::Conflict).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Alert, AlertFilter, AlertStatus, Customer, CustomerSignals, FollowUp, HealthScoreSnapshot,
    HistoryQuery, SeverityCount, Ticket,
};

#[cfg(test)]
pub mod memory;
pub mod postgres;

pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_customers(&self) -> Result<Vec<Customer>>;

    async fn latest_signals(&self, customer_id: Uuid) -> Result<Option<CustomerSignals>>;

    /// Appends a snapshot. Fails with `SnapshotOutOfOrder` unless it is strictly
    /// newer than the customer's latest snapshot.
    async fn save_snapshot(&self, snapshot: &HealthScoreSnapshot) -> Result<()>;

    async fn latest_snapshot(&self, customer_id: Uuid) -> Result<Option<HealthScoreSnapshot>>;

    /// Most recent first. Unknown customers yield an empty list.
    async fn snapshot_history(
        &self,
        customer_id: Uuid,
        query: &HistoryQuery,
    ) -> Result<Vec<HealthScoreSnapshot>>;

    /// Next per-month ticket sequence, starting at 1.
    async fn next_ticket_sequence(&self, year: i32, month: u32) -> Result<u32>;

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<()>;

    async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>>;

    async fn find_ticket_by_number(&self, ticket_number: &str) -> Result<Option<Ticket>>;

    async fn list_open_tickets(&self) -> Result<Vec<Ticket>>;

    /// Every ticket of one customer, oldest first.
    async fn list_customer_tickets(&self, customer_id: Uuid) -> Result<Vec<Ticket>>;

    /// Writes `ticket` only if the stored row still matches `previous` on
    /// status and breach flag. Returns whether the write happened.
    async fn replace_ticket(&self, ticket: &Ticket, previous: &Ticket) -> Result<bool>;

    async fn insert_alert(&self, alert: &Alert) -> Result<()>;

    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>>;

    /// Writes `alert` only if the stored status is still `expected`.
    async fn replace_alert(&self, alert: &Alert, expected: AlertStatus) -> Result<bool>;

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>>;

    async fn due_snoozed_alerts(&self, now: DateTime<Utc>) -> Result<Vec<Alert>>;

    async fn count_open_alerts_by_severity(&self) -> Result<Vec<SeverityCount>>;

    async fn insert_follow_up(&self, follow_up: &FollowUp) -> Result<()>;
}
