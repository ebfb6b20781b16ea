//! Alert rules and the alert lifecycle.
//!
//! Automatic alerts come from [`Signal`]s raised by the scheduler or by
//! ticket checks. Every alert, automatic or manual, goes through
//! `Store::insert_alert`, which holds at most one open alert per
//! `(customer_id, alert_type)`.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::AlertRulesConfig;
use crate::error::{EngineError, Result};
use crate::models::{
    Alert, AlertFilter, AlertSeverity, AlertStatus, AlertType, Customer, FollowUp,
    HealthScoreSnapshot, NewAlert, RiskLevel, SeverityCount, Ticket, TicketPriority,
};
use crate::sla::SlaCheck;
use crate::store::Store;

const MAX_WRITE_ATTEMPTS: usize = 3;

/// Something the engine may turn into an alert. Each signal maps to one rule.
#[derive(Debug, Clone, Copy)]
pub enum Signal<'a> {
    /// A freshly saved snapshot and the one it replaced as latest.
    ScoreComputed {
        current: &'a HealthScoreSnapshot,
        previous: Option<&'a HealthScoreSnapshot>,
    },
    ContractWindow {
        customer: &'a Customer,
        today: NaiveDate,
    },
    SlaBreached {
        ticket: &'a Ticket,
        check: &'a SlaCheck,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub notes: Option<String>,
    pub resolved_by: Option<String>,
    pub follow_up: Option<NewFollowUp>,
}

#[derive(Debug, Clone)]
pub struct NewFollowUp {
    pub title: String,
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Snooze {
    pub until: DateTime<Utc>,
    pub reason: Option<String>,
    pub snoozed_by: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkOutcome {
    pub updated: Vec<Uuid>,
    pub unchanged: Vec<Uuid>,
    pub rejected: Vec<Uuid>,
    pub not_found: Vec<Uuid>,
}

pub fn health_drop_rule(
    rules: &AlertRulesConfig,
    current: &HealthScoreSnapshot,
    previous: Option<&HealthScoreSnapshot>,
) -> Option<NewAlert> {
    let previous = previous?;
    let score = current.overall_score();
    let drop = previous.overall_score() - score;

    if score >= rules.health_drop_floor || drop <= 0 || drop < rules.health_drop_min_delta {
        return None;
    }

    let severity = match score {
        s if s < 40 => AlertSeverity::Critical,
        s if s < 60 => AlertSeverity::High,
        _ => AlertSeverity::Medium,
    };

    Some(NewAlert {
        customer_id: Some(current.customer_id),
        alert_type: AlertType::HealthDrop,
        severity,
        title: format!("Health score dropped to {score}"),
        description: format!(
            "Composite health fell {drop} points from {} and is below the floor of {}.",
            previous.overall_score(),
            rules.health_drop_floor
        ),
        triggered_value: Some(score as f64),
        threshold: Some(rules.health_drop_floor as f64),
    })
}

/// Fires when a customer enters the critical band, not on every snapshot inside it.
pub fn churn_risk_rule(
    rules: &AlertRulesConfig,
    current: &HealthScoreSnapshot,
    previous: Option<&HealthScoreSnapshot>,
) -> Option<NewAlert> {
    if !rules.churn_risk_enabled || current.risk_level() != RiskLevel::Critical {
        return None;
    }
    if previous.is_some_and(|previous| previous.risk_level() == RiskLevel::Critical) {
        return None;
    }

    Some(NewAlert {
        customer_id: Some(current.customer_id),
        alert_type: AlertType::ChurnRisk,
        severity: AlertSeverity::Critical,
        title: "Customer at critical churn risk".to_string(),
        description: format!(
            "Composite health of {} is in the critical band ({} trend).",
            current.overall_score(),
            current.trend
        ),
        triggered_value: Some(current.overall_score() as f64),
        threshold: Some(40.0),
    })
}

pub fn contract_expiry_rule(
    rules: &AlertRulesConfig,
    customer: &Customer,
    today: NaiveDate,
) -> Option<NewAlert> {
    let end = customer.contract_end_date?;
    let days_left = (end - today).num_days();
    if days_left < 0 {
        return None;
    }

    let window = rules
        .contract_windows_days
        .iter()
        .copied()
        .filter(|window| days_left <= *window)
        .min()?;

    let severity = match days_left {
        0..=30 => AlertSeverity::High,
        31..=60 => AlertSeverity::Medium,
        _ => AlertSeverity::Low,
    };

    Some(NewAlert {
        customer_id: Some(customer.id),
        alert_type: AlertType::ContractExpiry,
        severity,
        title: format!("Contract for {} ends in {days_left} days", customer.name),
        description: format!("Contract end date {end} is inside the {window}-day renewal window."),
        triggered_value: Some(days_left as f64),
        threshold: Some(window as f64),
    })
}

pub fn escalation_rule(ticket: &Ticket, check: &SlaCheck) -> Option<NewAlert> {
    if !check.is_breached {
        return None;
    }

    let severity = match ticket.priority {
        TicketPriority::Critical => AlertSeverity::Critical,
        TicketPriority::High => AlertSeverity::High,
        TicketPriority::Medium => AlertSeverity::Medium,
        TicketPriority::Low => AlertSeverity::Low,
    };

    Some(NewAlert {
        customer_id: ticket.customer_id,
        alert_type: AlertType::Escalation,
        severity,
        title: format!("Ticket {} breached its SLA", ticket.ticket_number),
        description: format!(
            "{} priority ticket open {:.1}h against a {:.0}h threshold: {}",
            ticket.priority, check.hours_open, check.threshold_hours, ticket.subject
        ),
        triggered_value: Some(check.hours_open),
        threshold: Some(check.threshold_hours),
    })
}

impl Alert {
    /// Returns false when the alert was already resolved.
    pub fn apply_resolution(&mut self, resolution: &Resolution, now: DateTime<Utc>) -> bool {
        if !self.status.is_open() {
            return false;
        }

        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(now);
        self.resolved_by = resolution.resolved_by.clone();
        self.resolution_notes = resolution.notes.clone();
        self.clear_snooze();
        self.updated_at = now;
        true
    }

    pub fn apply_snooze(&mut self, snooze: &Snooze, now: DateTime<Utc>) -> Result<bool> {
        if !self.status.is_open() {
            return Err(EngineError::InvalidTransition {
                entity: "alert",
                from: self.status.to_string(),
                to: AlertStatus::Snoozed.to_string(),
            });
        }
        if snooze.until <= now {
            return Err(EngineError::Validation(
                "snooze time must be in the future".to_string(),
            ));
        }
        if self.status == AlertStatus::Snoozed
            && self.snoozed_until == Some(snooze.until)
            && self.snooze_reason == snooze.reason
        {
            return Ok(false);
        }

        self.status = AlertStatus::Snoozed;
        self.snoozed_until = Some(snooze.until);
        self.snoozed_by = snooze.snoozed_by.clone();
        self.snooze_reason = snooze.reason.clone();
        self.updated_at = now;
        Ok(true)
    }

    /// Moves a snoozed alert back to active once its snooze has elapsed.
    pub fn apply_reactivation(&mut self, now: DateTime<Utc>) -> bool {
        let due = self.snoozed_until.map_or(true, |until| until <= now);
        if self.status != AlertStatus::Snoozed || !due {
            return false;
        }

        self.status = AlertStatus::Active;
        self.clear_snooze();
        self.updated_at = now;
        true
    }

    fn clear_snooze(&mut self) {
        self.snoozed_until = None;
        self.snoozed_by = None;
        self.snooze_reason = None;
    }
}

pub struct AlertEngine {
    store: Arc<dyn Store>,
    rules: AlertRulesConfig,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn Store>, rules: AlertRulesConfig) -> Self {
        Self { store, rules }
    }

    /// Runs the rules a signal maps to and returns the alerts actually raised.
    pub async fn evaluate(&self, signal: Signal<'_>, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        let candidates: Vec<NewAlert> = match signal {
            Signal::ScoreComputed { current, previous } => [
                health_drop_rule(&self.rules, current, previous),
                churn_risk_rule(&self.rules, current, previous),
            ]
            .into_iter()
            .flatten()
            .collect(),
            Signal::ContractWindow { customer, today } => {
                match contract_expiry_rule(&self.rules, customer, today) {
                    Some(fields) if !self.contract_window_alerted(customer, &fields).await? => {
                        vec![fields]
                    }
                    _ => Vec::new(),
                }
            }
            Signal::SlaBreached { ticket, check } => {
                escalation_rule(ticket, check).into_iter().collect()
            }
        };

        let mut raised = Vec::new();
        for fields in candidates {
            if let Some(alert) = self.raise(fields, now).await? {
                raised.push(alert);
            }
        }
        Ok(raised)
    }

    /// Whether the latest contract alert for this customer, resolved or not,
    /// already covers the current contract end date and window.
    async fn contract_window_alerted(&self, customer: &Customer, fields: &NewAlert) -> Result<bool> {
        let (Some(end), Some(window)) = (customer.contract_end_date, fields.threshold) else {
            return Ok(false);
        };

        let latest = self
            .store
            .list_alerts(&AlertFilter {
                alert_type: Some(AlertType::ContractExpiry),
                customer_id: Some(customer.id),
                limit: Some(1),
                ..AlertFilter::default()
            })
            .await?;

        let window_opened = end - Duration::days(window as i64);
        Ok(latest.first().is_some_and(|previous| {
            previous.threshold == Some(window) && previous.created_at.date_naive() >= window_opened
        }))
    }

    async fn raise(&self, fields: NewAlert, now: DateTime<Utc>) -> Result<Option<Alert>> {
        let alert = Alert::new(fields, now);
        match self.store.insert_alert(&alert).await {
            Ok(()) => {
                tracing::info!(
                    alert_id = %alert.id,
                    alert_type = %alert.alert_type,
                    severity = %alert.severity,
                    customer_id = ?alert.customer_id,
                    "alert raised"
                );
                Ok(Some(alert))
            }
            Err(EngineError::Conflict { .. }) => {
                tracing::debug!(
                    alert_type = %alert.alert_type,
                    customer_id = ?alert.customer_id,
                    "open alert already exists, discarding"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Manual alert. A duplicate of an open pair surfaces as `Conflict`.
    pub async fn create(&self, fields: NewAlert, now: DateTime<Utc>) -> Result<Alert> {
        if fields.title.trim().is_empty() {
            return Err(EngineError::Validation("alert title is required".to_string()));
        }

        let alert = Alert::new(fields, now);
        self.store.insert_alert(&alert).await?;
        tracing::info!(alert_id = %alert.id, alert_type = %alert.alert_type, "manual alert created");
        Ok(alert)
    }

    pub async fn resolve(
        &self,
        alert_id: Uuid,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<Alert> {
        let (alert, changed) = self
            .mutate(alert_id, |alert| Ok(alert.apply_resolution(resolution, now)))
            .await?;

        if changed {
            if let Some(follow_up) = &resolution.follow_up {
                self.store
                    .insert_follow_up(&FollowUp {
                        id: Uuid::new_v4(),
                        alert_id,
                        title: follow_up.title.clone(),
                        due_at: follow_up.due_at,
                        created_at: now,
                    })
                    .await?;
            }
        }
        Ok(alert)
    }

    pub async fn snooze(&self, alert_id: Uuid, snooze: &Snooze, now: DateTime<Utc>) -> Result<Alert> {
        if snooze.until <= now {
            return Err(EngineError::Validation(
                "snooze time must be in the future".to_string(),
            ));
        }

        let (alert, _) = self
            .mutate(alert_id, |alert| alert.apply_snooze(snooze, now))
            .await?;
        Ok(alert)
    }

    pub async fn bulk_resolve(
        &self,
        alert_ids: &[Uuid],
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<BulkOutcome> {
        let mut outcome = BulkOutcome::default();

        for id in alert_ids {
            match self
                .mutate(*id, |alert| Ok(alert.apply_resolution(resolution, now)))
                .await
            {
                Ok((_, true)) => outcome.updated.push(*id),
                Ok((_, false)) => outcome.unchanged.push(*id),
                Err(EngineError::NotFound { .. }) => outcome.not_found.push(*id),
                Err(err) => return Err(err),
            }
        }

        Ok(outcome)
    }

    pub async fn bulk_snooze(
        &self,
        alert_ids: &[Uuid],
        snooze: &Snooze,
        now: DateTime<Utc>,
    ) -> Result<BulkOutcome> {
        if snooze.until <= now {
            return Err(EngineError::Validation(
                "snooze time must be in the future".to_string(),
            ));
        }

        let mut outcome = BulkOutcome::default();
        for id in alert_ids {
            match self
                .mutate(*id, |alert| alert.apply_snooze(snooze, now))
                .await
            {
                Ok((_, true)) => outcome.updated.push(*id),
                Ok((_, false)) => outcome.unchanged.push(*id),
                Err(EngineError::InvalidTransition { .. }) => outcome.rejected.push(*id),
                Err(EngineError::NotFound { .. }) => outcome.not_found.push(*id),
                Err(err) => return Err(err),
            }
        }

        Ok(outcome)
    }

    /// Returns every snoozed alert whose snooze has elapsed to active.
    pub async fn reactivate_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut reactivated = 0;

        for alert in self.store.due_snoozed_alerts(now).await? {
            let (_, changed) = self
                .mutate(alert.id, |alert| Ok(alert.apply_reactivation(now)))
                .await?;
            if changed {
                tracing::debug!(alert_id = %alert.id, "snooze elapsed, alert active again");
                reactivated += 1;
            }
        }

        Ok(reactivated)
    }

    pub async fn get(&self, alert_id: Uuid) -> Result<Alert> {
        self.store
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| EngineError::not_found("alert", alert_id))
    }

    pub async fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        self.store.list_alerts(filter).await
    }

    pub async fn summary(&self) -> Result<Vec<SeverityCount>> {
        self.store.count_open_alerts_by_severity().await
    }

    /// Read, apply, compare-and-set. Retries when another writer moved the
    /// alert's status in between.
    async fn mutate<F>(&self, alert_id: Uuid, mut apply: F) -> Result<(Alert, bool)>
    where
        F: FnMut(&mut Alert) -> Result<bool>,
    {
        let mut last_seen = None;

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self.get(alert_id).await?;
            let mut next = current.clone();
            if !apply(&mut next)? {
                return Ok((current, false));
            }
            if self.store.replace_alert(&next, current.status).await? {
                return Ok((next, true));
            }
            last_seen = Some(current);
        }

        let alert = last_seen.ok_or_else(|| EngineError::not_found("alert", alert_id))?;
        Err(EngineError::Conflict {
            customer_id: alert.customer_id,
            alert_type: alert.alert_type.key(),
        })
    }
}
