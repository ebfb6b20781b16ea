use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    Alert, AlertFilter, AlertSeverity, AlertStatus, Customer, CustomerSignals, FollowUp,
    HealthScoreSnapshot, HistoryQuery, SeverityCount, SubScores, Ticket, TicketPriority,
};
use crate::store::Store;

const SNAPSHOT_COLUMNS: &str = "id, customer_id, calculated_at, product_adoption, support_health, \
     engagement, financial_health, sla_compliance, trend";

const TICKET_COLUMNS: &str = "id, ticket_number, customer_id, subject, priority, status, \
     created_at, resolved_at, sla_breached, resolution_time_hours";

const ALERT_COLUMNS: &str = "id, customer_id, alert_type, severity, title, description, \
     triggered_value, threshold, status, resolved_at, resolved_by, resolution_notes, \
     snoozed_until, snoozed_by, snooze_reason, created_at, updated_at";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let today = Utc::now().date_naive();
    let customers = vec![
        (
            Uuid::parse_str("6b1f0f3e-5a7c-4d2e-9a51-0f4f2c1d8e31")?,
            "Northwind Traders",
            Some(today + Duration::days(25)),
            [Some(82), Some(74), Some(88), Some(90), Some(95)],
        ),
        (
            Uuid::parse_str("a3c9e2d4-1b6f-4f0a-8e77-5d2b9c4e6f10")?,
            "Contoso Retail",
            Some(today + Duration::days(200)),
            [Some(55), Some(48), Some(62), None, Some(70)],
        ),
        (
            Uuid::parse_str("f0d4b8a2-3e1c-47b9-a6d5-9c8e7f6a5b42")?,
            "Fabrikam Logistics",
            None,
            [Some(30), Some(25), Some(41), Some(38), Some(20)],
        ),
    ];

    for (id, name, contract_end_date, scores) in customers {
        let customer_id = upsert_customer(pool, id, name, contract_end_date).await?;

        sqlx::query(
            r#"
            INSERT INTO health_engine.customer_signals
            (id, customer_id, collected_at, product_adoption, support_health,
             engagement, financial_health, sla_compliance, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(Utc::now())
        .bind(scores[0])
        .bind(scores[1])
        .bind(scores[2])
        .bind(scores[3])
        .bind(scores[4])
        .bind(format!("seed-{name}"))
        .execute(pool)
        .await?;
    }

    Ok(())
}

/// Imports one row of sub-scores per customer. Headers from older exports
/// (`adoption_score`, `support_score`, ...) are accepted here and nowhere else.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        customer_name: String,
        contract_end_date: Option<NaiveDate>,
        collected_at: Option<DateTime<Utc>>,
        #[serde(alias = "adoption_score", alias = "product_adoption_score")]
        product_adoption: Option<i32>,
        #[serde(alias = "support_score")]
        support_health: Option<i32>,
        #[serde(alias = "engagement_score")]
        engagement: Option<i32>,
        #[serde(alias = "financial_score")]
        financial_health: Option<i32>,
        #[serde(alias = "sla_score")]
        sla_compliance: Option<i32>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let customer_id =
            upsert_customer(pool, Uuid::new_v4(), &row.customer_name, row.contract_end_date)
                .await?;

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let result = sqlx::query(
            r#"
            INSERT INTO health_engine.customer_signals
            (id, customer_id, collected_at, product_adoption, support_health,
             engagement, financial_health, sla_compliance, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(row.collected_at.unwrap_or_else(Utc::now))
        .bind(row.product_adoption)
        .bind(row.support_health)
        .bind(row.engagement)
        .bind(row.financial_health)
        .bind(row.sla_compliance)
        .bind(source_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

async fn upsert_customer(
    pool: &PgPool,
    id: Uuid,
    name: &str,
    contract_end_date: Option<NaiveDate>,
) -> anyhow::Result<Uuid> {
    let customer_id: Uuid = sqlx::query(
        r#"
        INSERT INTO health_engine.customers (id, name, contract_end_date)
        VALUES ($1, $2, $3)
        ON CONFLICT (name) DO UPDATE
        SET contract_end_date = COALESCE(EXCLUDED.contract_end_date, health_engine.customers.contract_end_date)
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(contract_end_date)
    .fetch_one(pool)
    .await?
    .try_get("id")?;

    Ok(customer_id)
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T>
where
    T: std::str::FromStr<Err = EngineError>,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
}

fn snapshot_from_row(row: &PgRow) -> Result<HealthScoreSnapshot> {
    Ok(HealthScoreSnapshot {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        calculated_at: row.try_get("calculated_at")?,
        sub_scores: SubScores {
            product_adoption: row.try_get("product_adoption")?,
            support_health: row.try_get("support_health")?,
            engagement: row.try_get("engagement")?,
            financial_health: row.try_get("financial_health")?,
            sla_compliance: row.try_get("sla_compliance")?,
        },
        trend: parse_column(row, "trend")?,
    })
}

fn ticket_from_row(row: &PgRow) -> Result<Ticket> {
    let raw_priority: String = row.try_get("priority")?;
    let priority = raw_priority
        .parse::<TicketPriority>()
        .map_err(|_| EngineError::UnconfiguredPriority(raw_priority.clone()))?;

    Ok(Ticket {
        id: row.try_get("id")?,
        ticket_number: row.try_get("ticket_number")?,
        customer_id: row.try_get("customer_id")?,
        subject: row.try_get("subject")?,
        priority,
        status: parse_column(row, "status")?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
        sla_breached: row.try_get("sla_breached")?,
        resolution_time_hours: row.try_get("resolution_time_hours")?,
    })
}

fn alert_from_row(row: &PgRow) -> Result<Alert> {
    Ok(Alert {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        alert_type: parse_column(row, "alert_type")?,
        severity: parse_column(row, "severity")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        triggered_value: row.try_get("triggered_value")?,
        threshold: row.try_get("threshold")?,
        status: parse_column(row, "status")?,
        resolved_at: row.try_get("resolved_at")?,
        resolved_by: row.try_get("resolved_by")?,
        resolution_notes: row.try_get("resolution_notes")?,
        snoozed_until: row.try_get("snoozed_until")?,
        snoozed_by: row.try_get("snoozed_by")?,
        snooze_reason: row.try_get("snooze_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ticket_exists(&self, id: Uuid) -> Result<bool> {
        let found = sqlx::query("SELECT 1 FROM health_engine.tickets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn alert_exists(&self, id: Uuid) -> Result<bool> {
        let found = sqlx::query("SELECT 1 FROM health_engine.alerts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn list_customers(&self) -> Result<Vec<Customer>> {
        let rows = sqlx::query(
            "SELECT id, name, contract_end_date FROM health_engine.customers ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut customers = Vec::with_capacity(rows.len());
        for row in rows {
            customers.push(Customer {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                contract_end_date: row.try_get("contract_end_date")?,
            });
        }
        Ok(customers)
    }

    async fn latest_signals(&self, customer_id: Uuid) -> Result<Option<CustomerSignals>> {
        let row = sqlx::query(
            r#"
            SELECT customer_id, collected_at, product_adoption, support_health,
                   engagement, financial_health, sla_compliance
            FROM health_engine.customer_signals
            WHERE customer_id = $1
            ORDER BY collected_at DESC
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(CustomerSignals {
            customer_id: row.try_get("customer_id")?,
            collected_at: row.try_get("collected_at")?,
            product_adoption: row.try_get("product_adoption")?,
            support_health: row.try_get("support_health")?,
            engagement: row.try_get("engagement")?,
            financial_health: row.try_get("financial_health")?,
            sla_compliance: row.try_get("sla_compliance")?,
        }))
    }

    async fn save_snapshot(&self, snapshot: &HealthScoreSnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Row lock on the customer serializes writers of one series.
        sqlx::query("SELECT id FROM health_engine.customers WHERE id = $1 FOR UPDATE")
            .bind(snapshot.customer_id)
            .fetch_optional(&mut *tx)
            .await?;

        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT max(calculated_at) FROM health_engine.health_scores WHERE customer_id = $1",
        )
        .bind(snapshot.customer_id)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(latest) = latest {
            if snapshot.calculated_at <= latest {
                return Err(EngineError::SnapshotOutOfOrder {
                    customer_id: snapshot.customer_id,
                });
            }
        }

        let scores = &snapshot.sub_scores;
        sqlx::query(
            r#"
            INSERT INTO health_engine.health_scores
            (id, customer_id, calculated_at, product_adoption, support_health, engagement,
             financial_health, sla_compliance, overall_score, risk_level, trend)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.customer_id)
        .bind(snapshot.calculated_at)
        .bind(scores.product_adoption)
        .bind(scores.support_health)
        .bind(scores.engagement)
        .bind(scores.financial_health)
        .bind(scores.sla_compliance)
        .bind(snapshot.overall_score())
        .bind(snapshot.risk_level().as_str())
        .bind(snapshot.trend.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn latest_snapshot(&self, customer_id: Uuid) -> Result<Option<HealthScoreSnapshot>> {
        let row = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM health_engine.health_scores \
             WHERE customer_id = $1 ORDER BY calculated_at DESC LIMIT 1"
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn snapshot_history(
        &self,
        customer_id: Uuid,
        query: &HistoryQuery,
    ) -> Result<Vec<HealthScoreSnapshot>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM health_engine.health_scores WHERE customer_id = "
        ));
        builder.push_bind(customer_id);
        if let Some(from) = query.from {
            builder.push(" AND calculated_at >= ").push_bind(from);
        }
        if let Some(to) = query.to {
            builder.push(" AND calculated_at <= ").push_bind(to);
        }
        builder
            .push(" ORDER BY calculated_at DESC LIMIT ")
            .push_bind(query.effective_limit() as i64)
            .push(" OFFSET ")
            .push_bind(query.offset as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn next_ticket_sequence(&self, year: i32, month: u32) -> Result<u32> {
        let value: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO health_engine.ticket_sequences (year, month, last_value)
            VALUES ($1, $2, 1)
            ON CONFLICT (year, month) DO UPDATE
            SET last_value = health_engine.ticket_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(year)
        .bind(month as i32)
        .fetch_one(&self.pool)
        .await?;

        u32::try_from(value)
            .map_err(|_| EngineError::Validation(format!("invalid ticket sequence {value}")))
    }

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO health_engine.tickets
            (id, ticket_number, customer_id, subject, priority, status, created_at,
             resolved_at, sla_breached, resolution_time_hours)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(ticket.id)
        .bind(&ticket.ticket_number)
        .bind(ticket.customer_id)
        .bind(&ticket.subject)
        .bind(ticket.priority.as_str())
        .bind(ticket.status.as_str())
        .bind(ticket.created_at)
        .bind(ticket.resolved_at)
        .bind(ticket.sla_breached)
        .bind(ticket.resolution_time_hours)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>> {
        let row = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM health_engine.tickets WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(ticket_from_row).transpose()
    }

    async fn find_ticket_by_number(&self, ticket_number: &str) -> Result<Option<Ticket>> {
        let row = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM health_engine.tickets WHERE ticket_number = $1"
        ))
        .bind(ticket_number)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(ticket_from_row).transpose()
    }

    async fn list_open_tickets(&self) -> Result<Vec<Ticket>> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM health_engine.tickets \
             WHERE status IN ('open', 'in_progress') ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut tickets = Vec::with_capacity(rows.len());
        for row in &rows {
            match ticket_from_row(row) {
                Ok(ticket) => tickets.push(ticket),
                Err(err @ EngineError::UnconfiguredPriority(_)) => {
                    let number: String = row.try_get("ticket_number")?;
                    tracing::warn!(ticket = %number, error = %err, "ticket excluded from SLA checks");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(tickets)
    }

    async fn list_customer_tickets(&self, customer_id: Uuid) -> Result<Vec<Ticket>> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM health_engine.tickets \
             WHERE customer_id = $1 ORDER BY created_at"
        ))
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(ticket_from_row).collect()
    }

    async fn replace_ticket(&self, ticket: &Ticket, previous: &Ticket) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE health_engine.tickets
            SET status = $2, resolved_at = $3, sla_breached = $4, resolution_time_hours = $5
            WHERE id = $1 AND status = $6 AND sla_breached = $7
            "#,
        )
        .bind(ticket.id)
        .bind(ticket.status.as_str())
        .bind(ticket.resolved_at)
        .bind(ticket.sla_breached)
        .bind(ticket.resolution_time_hours)
        .bind(previous.status.as_str())
        .bind(previous.sla_breached)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if !self.ticket_exists(ticket.id).await? {
            return Err(EngineError::not_found("ticket", ticket.id));
        }
        Ok(false)
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO health_engine.alerts
            (id, customer_id, alert_type, severity, title, description, triggered_value,
             threshold, status, resolved_at, resolved_by, resolution_notes, snoozed_until,
             snoozed_by, snooze_reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(alert.id)
        .bind(alert.customer_id)
        .bind(alert.alert_type.key())
        .bind(alert.severity.as_str())
        .bind(&alert.title)
        .bind(&alert.description)
        .bind(alert.triggered_value)
        .bind(alert.threshold)
        .bind(alert.status.as_str())
        .bind(alert.resolved_at)
        .bind(&alert.resolved_by)
        .bind(&alert.resolution_notes)
        .bind(alert.snoozed_until)
        .bind(&alert.snoozed_by)
        .bind(&alert.snooze_reason)
        .bind(alert.created_at)
        .bind(alert.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::Conflict {
                customer_id: alert.customer_id,
                alert_type: alert.alert_type.key(),
            });
        }
        Ok(())
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>> {
        let row = sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM health_engine.alerts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(alert_from_row).transpose()
    }

    async fn replace_alert(&self, alert: &Alert, expected: AlertStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE health_engine.alerts
            SET status = $2, resolved_at = $3, resolved_by = $4, resolution_notes = $5,
                snoozed_until = $6, snoozed_by = $7, snooze_reason = $8, updated_at = $9
            WHERE id = $1 AND status = $10
            "#,
        )
        .bind(alert.id)
        .bind(alert.status.as_str())
        .bind(alert.resolved_at)
        .bind(&alert.resolved_by)
        .bind(&alert.resolution_notes)
        .bind(alert.snoozed_until)
        .bind(&alert.snoozed_by)
        .bind(&alert.snooze_reason)
        .bind(alert.updated_at)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if !self.alert_exists(alert.id).await? {
            return Err(EngineError::not_found("alert", alert.id));
        }
        Ok(false)
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ALERT_COLUMNS} FROM health_engine.alerts WHERE TRUE"
        ));
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(severity) = filter.severity {
            builder.push(" AND severity = ").push_bind(severity.as_str());
        }
        if let Some(alert_type) = &filter.alert_type {
            builder.push(" AND alert_type = ").push_bind(alert_type.key());
        }
        if let Some(customer_id) = filter.customer_id {
            builder.push(" AND customer_id = ").push_bind(customer_id);
        }
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.effective_limit() as i64)
            .push(" OFFSET ")
            .push_bind(filter.offset as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn due_snoozed_alerts(&self, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        let rows = sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM health_engine.alerts \
             WHERE status = 'snoozed' AND (snoozed_until IS NULL OR snoozed_until <= $1)"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(alert_from_row).collect()
    }

    async fn count_open_alerts_by_severity(&self) -> Result<Vec<SeverityCount>> {
        let rows = sqlx::query(
            r#"
            SELECT severity, count(*) AS total
            FROM health_engine.alerts
            WHERE status <> 'resolved'
            GROUP BY severity
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let severity: AlertSeverity = parse_column(row, "severity")?;
            let total: i64 = row.try_get("total")?;
            counts.push(SeverityCount {
                severity,
                count: total as usize,
            });
        }
        counts.sort_by_key(|entry| entry.severity);
        Ok(counts)
    }

    async fn insert_follow_up(&self, follow_up: &FollowUp) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO health_engine.follow_ups (id, alert_id, title, due_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(follow_up.id)
        .bind(follow_up.alert_id)
        .bind(&follow_up.title)
        .bind(follow_up.due_at)
        .bind(follow_up.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
