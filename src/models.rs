use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::scoring;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum stored as text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(EngineError::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub name: String,
    pub contract_end_date: Option<NaiveDate>,
}

/// Raw sub-scores supplied for one customer in one cycle. `None` is explicit absence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerSignals {
    pub customer_id: Uuid,
    pub collected_at: DateTime<Utc>,
    pub product_adoption: Option<i32>,
    pub support_health: Option<i32>,
    pub engagement: Option<i32>,
    pub financial_health: Option<i32>,
    pub sla_compliance: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubScores {
    pub product_adoption: i32,
    pub support_health: i32,
    pub engagement: i32,
    pub financial_health: i32,
    pub sla_compliance: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

text_enum!(RiskLevel {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

text_enum!(Trend {
    Improving => "improving",
    Stable => "stable",
    Declining => "declining",
});

/// One immutable score computation. The composite score and risk band are
/// always derived from `sub_scores`, never carried separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthScoreSnapshot {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub calculated_at: DateTime<Utc>,
    pub sub_scores: SubScores,
    pub trend: Trend,
}

impl HealthScoreSnapshot {
    pub fn overall_score(&self) -> i32 {
        scoring::weighted_score(&self.sub_scores)
    }

    pub fn risk_level(&self) -> RiskLevel {
        RiskLevel::from_score(self.overall_score())
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl HistoryQuery {
    pub const DEFAULT_LIMIT: usize = 50;

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Critical,
    High,
    Medium,
    Low,
}

text_enum!(TicketPriority {
    Critical => "critical",
    High => "high",
    Medium => "medium",
    Low => "low",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

text_enum!(TicketStatus {
    Open => "open",
    InProgress => "in_progress",
    Resolved => "resolved",
    Closed => "closed",
});

impl TicketStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, TicketStatus::Open | TicketStatus::InProgress)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub ticket_number: String,
    pub customer_id: Option<Uuid>,
    pub subject: String,
    pub priority: TicketPriority,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub sla_breached: bool,
    pub resolution_time_hours: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HealthDrop,
    ChurnRisk,
    ContractExpiry,
    LowCsat,
    Escalation,
    Inactivity,
    UsageDrop,
    Custom(String),
}

impl AlertType {
    /// Stable text key; also the deduplication key for open alerts.
    pub fn key(&self) -> String {
        match self {
            AlertType::HealthDrop => "health_drop".to_string(),
            AlertType::ChurnRisk => "churn_risk".to_string(),
            AlertType::ContractExpiry => "contract_expiry".to_string(),
            AlertType::LowCsat => "low_csat".to_string(),
            AlertType::Escalation => "escalation".to_string(),
            AlertType::Inactivity => "inactivity".to_string(),
            AlertType::UsageDrop => "usage_drop".to_string(),
            AlertType::Custom(label) => format!("custom:{label}"),
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for AlertType {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if let Some(label) = value.strip_prefix("custom:") {
            if label.trim().is_empty() {
                return Err(EngineError::Validation(
                    "custom alert type needs a label".to_string(),
                ));
            }
            return Ok(AlertType::Custom(label.trim().to_string()));
        }

        match value.to_ascii_lowercase().as_str() {
            "health_drop" => Ok(AlertType::HealthDrop),
            "churn_risk" => Ok(AlertType::ChurnRisk),
            "contract_expiry" => Ok(AlertType::ContractExpiry),
            "low_csat" => Ok(AlertType::LowCsat),
            "escalation" => Ok(AlertType::Escalation),
            "inactivity" => Ok(AlertType::Inactivity),
            "usage_drop" => Ok(AlertType::UsageDrop),
            other => Err(EngineError::Validation(format!(
                "unknown alert type '{other}' (use custom:<label> for free-form types)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Critical,
    High,
    Medium,
    Low,
}

text_enum!(AlertSeverity {
    Critical => "critical",
    High => "high",
    Medium => "medium",
    Low => "low",
});

impl AlertSeverity {
    pub const ALL: [AlertSeverity; 4] = [
        AlertSeverity::Critical,
        AlertSeverity::High,
        AlertSeverity::Medium,
        AlertSeverity::Low,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Snoozed,
    Resolved,
}

text_enum!(AlertStatus {
    Active => "active",
    Snoozed => "snoozed",
    Resolved => "resolved",
});

impl AlertStatus {
    /// Active and snoozed alerts both hold the dedup slot for their pair.
    pub fn is_open(&self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub customer_id: Option<Uuid>,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub description: String,
    pub triggered_value: Option<f64>,
    pub threshold: Option<f64>,
    pub status: AlertStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub snoozed_by: Option<String>,
    pub snooze_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(fields: NewAlert, now: DateTime<Utc>) -> Self {
        Alert {
            id: Uuid::new_v4(),
            customer_id: fields.customer_id,
            alert_type: fields.alert_type,
            severity: fields.severity,
            title: fields.title,
            description: fields.description,
            triggered_value: fields.triggered_value,
            threshold: fields.threshold,
            status: AlertStatus::Active,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            snoozed_until: None,
            snoozed_by: None,
            snooze_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == AlertStatus::Resolved
    }

    pub fn is_snoozed(&self) -> bool {
        self.status == AlertStatus::Snoozed
    }
}

#[derive(Debug, Clone)]
pub struct NewAlert {
    pub customer_id: Option<Uuid>,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub description: String,
    pub triggered_value: Option<f64>,
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub status: Option<AlertStatus>,
    pub severity: Option<AlertSeverity>,
    pub alert_type: Option<AlertType>,
    pub customer_id: Option<Uuid>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl AlertFilter {
    pub const DEFAULT_LIMIT: usize = 50;

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUp {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub title: String,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeverityCount {
    pub severity: AlertSeverity,
    pub count: usize,
}
