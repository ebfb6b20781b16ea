//! Periodic evaluation pass.
//!
//! One task per customer, bounded by `scheduler.max_concurrency`. A customer is
//! only ever handled by one task per sweep, so its snapshot writes stay
//! ordered; a failed customer is logged and picked up again next sweep.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::alerts::{AlertEngine, Signal};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::models::Customer;
use crate::scoring;
use crate::sla;
use crate::store::Store;

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub customers_scored: usize,
    pub customers_skipped: usize,
    pub customers_failed: usize,
    pub alerts_raised: usize,
    pub snoozes_reactivated: usize,
    pub tickets_breached: usize,
}

#[derive(Debug, Default)]
struct CustomerOutcome {
    scored: bool,
    alerts_raised: usize,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    alerts: Arc<AlertEngine>,
    config: Arc<EngineConfig>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        let alerts = Arc::new(AlertEngine::new(store.clone(), config.alerts.clone()));
        Self {
            store,
            alerts,
            config: Arc::new(config),
        }
    }

    pub fn alerts(&self) -> &AlertEngine {
        &self.alerts
    }

    pub async fn run_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport {
            snoozes_reactivated: self.alerts.reactivate_due(now).await?,
            ..SweepReport::default()
        };

        let customers = self.store.list_customers().await?;
        tracing::info!(customers = customers.len(), "starting health sweep");

        let permits = Arc::new(Semaphore::new(self.config.scheduler.max_concurrency));
        let mut tasks = JoinSet::new();

        for customer in customers {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Config("scheduler permits closed".to_string()))?;
            let store = self.store.clone();
            let alerts = self.alerts.clone();
            let config = self.config.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let outcome = evaluate_customer(store.as_ref(), &alerts, &config, &customer, now).await;
                (customer.id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    if outcome.scored {
                        report.customers_scored += 1;
                    } else {
                        report.customers_skipped += 1;
                    }
                    report.alerts_raised += outcome.alerts_raised;
                }
                Ok((customer_id, Err(err))) => {
                    tracing::warn!(
                        %customer_id,
                        error = %err,
                        retryable = err.is_retryable(),
                        "customer evaluation failed, retrying next sweep"
                    );
                    report.customers_failed += 1;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "customer evaluation task aborted");
                    report.customers_failed += 1;
                }
            }
        }

        for update in sla::sweep_open_tickets(self.store.as_ref(), &self.config.sla, now).await? {
            report.tickets_breached += 1;
            let signal = Signal::SlaBreached {
                ticket: &update.ticket,
                check: &update.check,
            };
            report.alerts_raised += self.alerts.evaluate(signal, now).await?.len();
        }

        tracing::info!(
            scored = report.customers_scored,
            skipped = report.customers_skipped,
            failed = report.customers_failed,
            alerts = report.alerts_raised,
            reactivated = report.snoozes_reactivated,
            breached = report.tickets_breached,
            "health sweep finished"
        );
        Ok(report)
    }

    /// Sweeps on every tick until Ctrl-C.
    pub async fn run_forever(&self) -> Result<()> {
        let period = std::time::Duration::from_secs(self.config.scheduler.interval_secs);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_sweep(Utc::now()).await {
                        tracing::error!(error = %err, "health sweep failed");
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested, stopping scheduler");
                    return Ok(());
                }
            }
        }
    }
}

async fn evaluate_customer(
    store: &dyn Store,
    alerts: &AlertEngine,
    config: &EngineConfig,
    customer: &Customer,
    now: DateTime<Utc>,
) -> Result<CustomerOutcome> {
    let mut outcome = CustomerOutcome::default();

    let contract = Signal::ContractWindow {
        customer,
        today: now.date_naive(),
    };
    outcome.alerts_raised += alerts.evaluate(contract, now).await?.len();

    let previous = store.latest_snapshot(customer.id).await?;
    if let Some(previous) = &previous {
        let min_interval = Duration::seconds(config.scheduler.min_recompute_interval_secs);
        if now - previous.calculated_at < min_interval {
            tracing::debug!(customer_id = %customer.id, "scored recently, skipping");
            return Ok(outcome);
        }
    }

    let Some(signals) = store.latest_signals(customer.id).await? else {
        tracing::debug!(customer_id = %customer.id, "no signals collected yet");
        return Ok(outcome);
    };

    let snapshot = scoring::compute(&signals, previous.as_ref(), now);
    store.save_snapshot(&snapshot).await?;
    outcome.scored = true;
    tracing::debug!(
        customer_id = %customer.id,
        score = snapshot.overall_score(),
        risk = %snapshot.risk_level(),
        trend = %snapshot.trend,
        "snapshot saved"
    );

    let computed = Signal::ScoreComputed {
        current: &snapshot,
        previous: previous.as_ref(),
    };
    outcome.alerts_raised += alerts.evaluate(computed, now).await?.len();

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AlertFilter, AlertStatus, AlertType, CustomerSignals, HistoryQuery, TicketPriority, Trend,
    };
    use crate::sla::NewTicket;
    use crate::store::memory::MemoryStore;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 6, 0, 0).unwrap()
    }

    fn customer(name: &str) -> Customer {
        Customer {
            id: Uuid::new_v4(),
            name: name.to_string(),
            contract_end_date: None,
        }
    }

    fn signals(customer_id: Uuid, score: i32, at: DateTime<Utc>) -> CustomerSignals {
        CustomerSignals {
            customer_id,
            collected_at: at,
            product_adoption: Some(score),
            support_health: Some(score),
            engagement: Some(score),
            financial_health: Some(score),
            sla_compliance: Some(score),
        }
    }

    fn scheduler(store: Arc<MemoryStore>) -> Scheduler {
        Scheduler::new(store, EngineConfig::default())
    }

    #[tokio::test]
    async fn sweep_scores_customers_with_signals() {
        let store = Arc::new(MemoryStore::new());
        let healthy = customer("Contoso");
        let silent = customer("Fabrikam");
        store.add_customer(healthy.clone()).await;
        store.add_customer(silent.clone()).await;
        store.put_signals(signals(healthy.id, 85, start())).await;

        let report = scheduler(store.clone()).run_sweep(start()).await.unwrap();
        assert_eq!(report.customers_scored, 1);
        assert_eq!(report.customers_skipped, 1);
        assert_eq!(report.alerts_raised, 0);

        let latest = store.latest_snapshot(healthy.id).await.unwrap().unwrap();
        assert_eq!(latest.overall_score(), 85);
        assert_eq!(latest.trend, Trend::Stable);
        assert!(store.latest_snapshot(silent.id).await.unwrap().is_none());
        assert!(store
            .snapshot_history(silent.id, &HistoryQuery::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn declining_customer_alerts_once_across_sweeps() {
        let store = Arc::new(MemoryStore::new());
        let account = customer("Tailspin");
        store.add_customer(account.clone()).await;
        store.put_signals(signals(account.id, 80, start())).await;
        let scheduler = scheduler(store.clone());

        scheduler.run_sweep(start()).await.unwrap();

        let skipped = scheduler
            .run_sweep(start() + Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(skipped.customers_skipped, 1);

        store
            .put_signals(signals(account.id, 55, start() + Duration::hours(1)))
            .await;
        let dropped = scheduler
            .run_sweep(start() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(dropped.customers_scored, 1);
        assert_eq!(dropped.alerts_raised, 1);

        let again = scheduler
            .run_sweep(start() + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(again.alerts_raised, 0);

        let history = store
            .snapshot_history(account.id, &HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].calculated_at, start() + Duration::hours(2));
        assert_eq!(history[0].trend, Trend::Stable);
        assert_eq!(history[1].trend, Trend::Declining);

        let open = scheduler
            .alerts()
            .list(&AlertFilter {
                alert_type: Some(AlertType::HealthDrop),
                status: Some(AlertStatus::Active),
                ..AlertFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn failing_customer_does_not_stop_the_sweep() {
        let store = Arc::new(MemoryStore::new());
        let broken = customer("Litware");
        let fine = customer("Proseware");
        store.add_customer(broken.clone()).await;
        store.add_customer(fine.clone()).await;
        store.put_signals(signals(broken.id, 70, start())).await;
        store.put_signals(signals(fine.id, 70, start())).await;
        store.break_signals_for(broken.id).await;

        let report = scheduler(store.clone()).run_sweep(start()).await.unwrap();
        assert_eq!(report.customers_failed, 1);
        assert_eq!(report.customers_scored, 1);
        assert!(store.latest_snapshot(fine.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn critical_customer_raises_churn_risk_and_contract_alerts() {
        let store = Arc::new(MemoryStore::new());
        let mut account = customer("Adventure Works");
        account.contract_end_date = Some(start().date_naive() + Duration::days(20));
        store.add_customer(account.clone()).await;
        store.put_signals(signals(account.id, 30, start())).await;

        let report = scheduler(store.clone()).run_sweep(start()).await.unwrap();
        assert_eq!(report.alerts_raised, 2);

        let alerts = store.list_alerts(&AlertFilter::default()).await.unwrap();
        let mut types: Vec<String> = alerts.iter().map(|alert| alert.alert_type.key()).collect();
        types.sort();
        assert_eq!(types, vec!["churn_risk", "contract_expiry"]);
    }

    #[tokio::test]
    async fn resolved_alerts_do_not_refire_on_later_sweeps() {
        let store = Arc::new(MemoryStore::new());
        let mut account = customer("Blue Yonder");
        account.contract_end_date = Some(start().date_naive() + Duration::days(80));
        store.add_customer(account.clone()).await;
        store.put_signals(signals(account.id, 30, start())).await;
        let scheduler = scheduler(store.clone());

        let mut raised = 0;
        for hour in 0..4 {
            let at = start() + Duration::hours(hour);
            raised += scheduler.run_sweep(at).await.unwrap().alerts_raised;

            let open = scheduler
                .alerts()
                .list(&AlertFilter {
                    status: Some(AlertStatus::Active),
                    ..AlertFilter::default()
                })
                .await
                .unwrap();
            for alert in open {
                scheduler
                    .alerts()
                    .resolve(alert.id, &crate::alerts::Resolution::default(), at)
                    .await
                    .unwrap();
            }
        }

        assert_eq!(raised, 2);
        let alerts = store.list_alerts(&AlertFilter::default()).await.unwrap();
        let mut types: Vec<String> = alerts.iter().map(|alert| alert.alert_type.key()).collect();
        types.sort();
        assert_eq!(types, vec!["churn_risk", "contract_expiry"]);
    }

    #[tokio::test]
    async fn breached_ticket_escalates_once() {
        let store = Arc::new(MemoryStore::new());
        let account = customer("Wide World");
        store.add_customer(account.clone()).await;
        sla::open_ticket(
            store.as_ref(),
            NewTicket {
                customer_id: Some(account.id),
                subject: "API returning 500s".to_string(),
                priority: TicketPriority::Critical,
            },
            start(),
        )
        .await
        .unwrap();
        let scheduler = scheduler(store.clone());

        let first = scheduler
            .run_sweep(start() + Duration::hours(5))
            .await
            .unwrap();
        assert_eq!(first.tickets_breached, 1);
        assert_eq!(first.alerts_raised, 1);

        let second = scheduler
            .run_sweep(start() + Duration::hours(6))
            .await
            .unwrap();
        assert_eq!(second.tickets_breached, 0);
        assert_eq!(second.alerts_raised, 0);
    }

    #[tokio::test]
    async fn sweep_reactivates_elapsed_snoozes() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(store.clone());
        let alert = scheduler
            .alerts()
            .create(
                crate::models::NewAlert {
                    customer_id: None,
                    alert_type: AlertType::Custom("billing sync".to_string()),
                    severity: crate::models::AlertSeverity::Low,
                    title: "Billing sync lagging".to_string(),
                    description: String::new(),
                    triggered_value: None,
                    threshold: None,
                },
                start(),
            )
            .await
            .unwrap();
        scheduler
            .alerts()
            .snooze(
                alert.id,
                &crate::alerts::Snooze {
                    until: start() + Duration::hours(1),
                    reason: None,
                    snoozed_by: None,
                },
                start(),
            )
            .await
            .unwrap();

        let report = scheduler
            .run_sweep(start() + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(report.snoozes_reactivated, 1);
        assert_eq!(
            scheduler.alerts().get(alert.id).await.unwrap().status,
            AlertStatus::Active
        );
    }
}
