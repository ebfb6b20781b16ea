use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    Alert, AlertFilter, AlertSeverity, AlertStatus, Customer, CustomerSignals, FollowUp,
    HealthScoreSnapshot, HistoryQuery, SeverityCount, Ticket,
};
use crate::store::Store;

#[derive(Default)]
struct State {
    customers: Vec<Customer>,
    signals: HashMap<Uuid, CustomerSignals>,
    snapshots: HashMap<Uuid, Vec<HealthScoreSnapshot>>,
    ticket_sequences: HashMap<(i32, u32), u32>,
    tickets: Vec<Ticket>,
    alerts: Vec<Alert>,
    follow_ups: Vec<FollowUp>,
    broken_signals: HashSet<Uuid>,
    ticket_races: VecDeque<Box<dyn FnOnce(&mut Ticket) + Send>>,
}

fn in_range(query: &HistoryQuery, at: DateTime<Utc>) -> bool {
    query.from.map_or(true, |from| at >= from) && query.to.map_or(true, |to| at <= to)
}

fn matches_filter(filter: &AlertFilter, alert: &Alert) -> bool {
    filter.status.map_or(true, |status| alert.status == status)
        && filter.severity.map_or(true, |severity| alert.severity == severity)
        && filter
            .alert_type
            .as_ref()
            .map_or(true, |alert_type| &alert.alert_type == alert_type)
        && filter
            .customer_id
            .map_or(true, |customer_id| alert.customer_id == Some(customer_id))
}

/// Single-lock store used by tests; the lock is the per-pair serialization point.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_customer(&self, customer: Customer) {
        self.state.lock().await.customers.push(customer);
    }

    pub async fn put_signals(&self, signals: CustomerSignals) {
        self.state
            .lock()
            .await
            .signals
            .insert(signals.customer_id, signals);
    }

    /// Makes `latest_signals` fail for one customer.
    pub async fn break_signals_for(&self, customer_id: Uuid) {
        self.state.lock().await.broken_signals.insert(customer_id);
    }

    /// Applies `change` to the stored ticket just before the next
    /// `replace_ticket` compares, as a concurrent writer would.
    pub async fn race_next_ticket_write(&self, change: impl FnOnce(&mut Ticket) + Send + 'static) {
        self.state
            .lock()
            .await
            .ticket_races
            .push_back(Box::new(change));
    }

    pub async fn follow_ups(&self) -> Vec<FollowUp> {
        self.state.lock().await.follow_ups.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_customers(&self) -> Result<Vec<Customer>> {
        Ok(self.state.lock().await.customers.clone())
    }

    async fn latest_signals(&self, customer_id: Uuid) -> Result<Option<CustomerSignals>> {
        let state = self.state.lock().await;
        if state.broken_signals.contains(&customer_id) {
            return Err(EngineError::Storage(sqlx::Error::PoolTimedOut));
        }
        Ok(state.signals.get(&customer_id).cloned())
    }

    async fn save_snapshot(&self, snapshot: &HealthScoreSnapshot) -> Result<()> {
        let mut state = self.state.lock().await;
        let series = state.snapshots.entry(snapshot.customer_id).or_default();
        if let Some(latest) = series.last() {
            if snapshot.calculated_at <= latest.calculated_at {
                return Err(EngineError::SnapshotOutOfOrder {
                    customer_id: snapshot.customer_id,
                });
            }
        }
        series.push(snapshot.clone());
        Ok(())
    }

    async fn latest_snapshot(&self, customer_id: Uuid) -> Result<Option<HealthScoreSnapshot>> {
        let state = self.state.lock().await;
        Ok(state
            .snapshots
            .get(&customer_id)
            .and_then(|series| series.last().cloned()))
    }

    async fn snapshot_history(
        &self,
        customer_id: Uuid,
        query: &HistoryQuery,
    ) -> Result<Vec<HealthScoreSnapshot>> {
        let state = self.state.lock().await;
        let Some(series) = state.snapshots.get(&customer_id) else {
            return Ok(Vec::new());
        };

        Ok(series
            .iter()
            .rev()
            .filter(|snapshot| in_range(query, snapshot.calculated_at))
            .skip(query.offset)
            .take(query.effective_limit())
            .cloned()
            .collect())
    }

    async fn next_ticket_sequence(&self, year: i32, month: u32) -> Result<u32> {
        let mut state = self.state.lock().await;
        let sequence = state.ticket_sequences.entry((year, month)).or_insert(0);
        *sequence += 1;
        Ok(*sequence)
    }

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .tickets
            .iter()
            .any(|existing| existing.ticket_number == ticket.ticket_number)
        {
            return Err(EngineError::Validation(format!(
                "ticket number {} already exists",
                ticket.ticket_number
            )));
        }
        state.tickets.push(ticket.clone());
        Ok(())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>> {
        let state = self.state.lock().await;
        Ok(state.tickets.iter().find(|ticket| ticket.id == id).cloned())
    }

    async fn find_ticket_by_number(&self, ticket_number: &str) -> Result<Option<Ticket>> {
        let state = self.state.lock().await;
        Ok(state
            .tickets
            .iter()
            .find(|ticket| ticket.ticket_number == ticket_number)
            .cloned())
    }

    async fn list_open_tickets(&self) -> Result<Vec<Ticket>> {
        let state = self.state.lock().await;
        Ok(state
            .tickets
            .iter()
            .filter(|ticket| ticket.status.is_open())
            .cloned()
            .collect())
    }

    async fn list_customer_tickets(&self, customer_id: Uuid) -> Result<Vec<Ticket>> {
        let state = self.state.lock().await;
        Ok(state
            .tickets
            .iter()
            .filter(|ticket| ticket.customer_id == Some(customer_id))
            .cloned()
            .collect())
    }

    async fn replace_ticket(&self, ticket: &Ticket, previous: &Ticket) -> Result<bool> {
        let mut state = self.state.lock().await;
        let race = state.ticket_races.pop_front();
        let Some(stored) = state.tickets.iter_mut().find(|stored| stored.id == ticket.id) else {
            return Err(EngineError::not_found("ticket", ticket.id));
        };
        if let Some(race) = race {
            race(stored);
        }
        if stored.status != previous.status || stored.sla_breached != previous.sla_breached {
            return Ok(false);
        }
        *stored = ticket.clone();
        Ok(true)
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = alert.alert_type.key();
        let taken = state.alerts.iter().any(|existing| {
            existing.status.is_open()
                && existing.customer_id == alert.customer_id
                && existing.alert_type.key() == key
        });
        if taken {
            return Err(EngineError::Conflict {
                customer_id: alert.customer_id,
                alert_type: key,
            });
        }
        state.alerts.push(alert.clone());
        Ok(())
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>> {
        let state = self.state.lock().await;
        Ok(state.alerts.iter().find(|alert| alert.id == id).cloned())
    }

    async fn replace_alert(&self, alert: &Alert, expected: AlertStatus) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.alerts.iter_mut().find(|stored| stored.id == alert.id) else {
            return Err(EngineError::not_found("alert", alert.id));
        };
        if stored.status != expected {
            return Ok(false);
        }
        *stored = alert.clone();
        Ok(true)
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        let state = self.state.lock().await;
        let mut alerts: Vec<Alert> = state
            .alerts
            .iter()
            .filter(|alert| matches_filter(filter, alert))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(alerts
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .collect())
    }

    async fn due_snoozed_alerts(&self, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        let state = self.state.lock().await;
        Ok(state
            .alerts
            .iter()
            .filter(|alert| {
                alert.status == AlertStatus::Snoozed
                    && alert.snoozed_until.map_or(true, |until| until <= now)
            })
            .cloned()
            .collect())
    }

    async fn count_open_alerts_by_severity(&self) -> Result<Vec<SeverityCount>> {
        let state = self.state.lock().await;
        Ok(AlertSeverity::ALL
            .iter()
            .map(|severity| SeverityCount {
                severity: *severity,
                count: state
                    .alerts
                    .iter()
                    .filter(|alert| alert.status.is_open() && alert.severity == *severity)
                    .count(),
            })
            .filter(|entry| entry.count > 0)
            .collect())
    }

    async fn insert_follow_up(&self, follow_up: &FollowUp) -> Result<()> {
        self.state.lock().await.follow_ups.push(follow_up.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SubScores, Trend};
    use chrono::{Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 10, 8, 0, 0).unwrap()
    }

    fn snapshot(customer_id: Uuid, score: i32, at: DateTime<Utc>) -> HealthScoreSnapshot {
        HealthScoreSnapshot {
            id: Uuid::new_v4(),
            customer_id,
            calculated_at: at,
            sub_scores: SubScores {
                product_adoption: score,
                support_health: score,
                engagement: score,
                financial_health: score,
                sla_compliance: score,
            },
            trend: Trend::Stable,
        }
    }

    async fn store_with_history(customer_id: Uuid) -> MemoryStore {
        let store = MemoryStore::new();
        for (day, score) in [(0, 80), (1, 74), (2, 69), (3, 71)] {
            store
                .save_snapshot(&snapshot(customer_id, score, base() + Duration::days(day)))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn snapshots_must_be_strictly_newer() {
        let customer_id = Uuid::new_v4();
        let store = store_with_history(customer_id).await;
        let latest = base() + Duration::days(3);

        let same_instant = store
            .save_snapshot(&snapshot(customer_id, 50, latest))
            .await
            .unwrap_err();
        assert!(matches!(
            same_instant,
            EngineError::SnapshotOutOfOrder { customer_id: id } if id == customer_id
        ));

        let older = store
            .save_snapshot(&snapshot(customer_id, 50, base() + Duration::days(1)))
            .await;
        assert!(matches!(older, Err(EngineError::SnapshotOutOfOrder { .. })));

        let other_customer = store
            .save_snapshot(&snapshot(Uuid::new_v4(), 50, base()))
            .await;
        assert!(other_customer.is_ok());

        let stored = store.latest_snapshot(customer_id).await.unwrap().unwrap();
        assert_eq!(stored.calculated_at, latest);
        assert_eq!(stored.overall_score(), 71);
    }

    #[tokio::test]
    async fn history_is_newest_first_with_range_and_paging() {
        let customer_id = Uuid::new_v4();
        let store = store_with_history(customer_id).await;

        let all = store
            .snapshot_history(customer_id, &HistoryQuery::default())
            .await
            .unwrap();
        let scores: Vec<i32> = all.iter().map(|snapshot| snapshot.overall_score()).collect();
        assert_eq!(scores, vec![71, 69, 74, 80]);

        let paged = store
            .snapshot_history(
                customer_id,
                &HistoryQuery {
                    limit: Some(2),
                    offset: 1,
                    ..HistoryQuery::default()
                },
            )
            .await
            .unwrap();
        let scores: Vec<i32> = paged.iter().map(|snapshot| snapshot.overall_score()).collect();
        assert_eq!(scores, vec![69, 74]);

        let ranged = store
            .snapshot_history(
                customer_id,
                &HistoryQuery {
                    from: Some(base() + Duration::days(1)),
                    to: Some(base() + Duration::days(2)),
                    ..HistoryQuery::default()
                },
            )
            .await
            .unwrap();
        let days: Vec<DateTime<Utc>> = ranged.iter().map(|snapshot| snapshot.calculated_at).collect();
        assert_eq!(days, vec![base() + Duration::days(2), base() + Duration::days(1)]);

        assert!(store
            .snapshot_history(Uuid::new_v4(), &HistoryQuery::default())
            .await
            .unwrap()
            .is_empty());
    }
}
