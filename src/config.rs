//! Engine configuration, read from an optional TOML file.
//!
//! Every field has a default so an absent file or an empty section yields the
//! stock thresholds. The same [`SlaConfig`] is handed to the scheduler sweep
//! and to inline ticket checks.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::TicketPriority;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub sla: SlaConfig,

    #[serde(default)]
    pub alerts: AlertRulesConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path)
            .map_err(|err| EngineError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|err| EngineError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (priority, hours) in &self.sla.thresholds_hours {
            if !(hours.is_finite() && *hours > 0.0) {
                return Err(EngineError::Config(format!(
                    "sla threshold for {priority} must be a positive number of hours"
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.sla.at_risk_percent) {
            return Err(EngineError::Config(
                "sla.at_risk_percent must be within 0..=100".to_string(),
            ));
        }
        if !(0..=100).contains(&self.alerts.health_drop_floor) {
            return Err(EngineError::Config(
                "alerts.health_drop_floor must be within 0..=100".to_string(),
            ));
        }
        if self.alerts.health_drop_min_delta < 0 {
            return Err(EngineError::Config(
                "alerts.health_drop_min_delta cannot be negative".to_string(),
            ));
        }
        if self.alerts.contract_windows_days.is_empty()
            || self.alerts.contract_windows_days.iter().any(|days| *days <= 0)
        {
            return Err(EngineError::Config(
                "alerts.contract_windows_days needs at least one positive window".to_string(),
            ));
        }
        if self.scheduler.max_concurrency == 0 {
            return Err(EngineError::Config(
                "scheduler.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.scheduler.interval_secs == 0 {
            return Err(EngineError::Config(
                "scheduler.interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaConfig {
    /// Maximum hours to resolution, keyed by priority.
    #[serde(default = "default_thresholds")]
    pub thresholds_hours: BTreeMap<TicketPriority, f64>,

    #[serde(default = "default_at_risk_percent")]
    pub at_risk_percent: f64,
}

impl SlaConfig {
    pub fn threshold_hours(&self, priority: TicketPriority) -> Result<f64> {
        self.thresholds_hours
            .get(&priority)
            .copied()
            .ok_or_else(|| EngineError::UnconfiguredPriority(priority.to_string()))
    }
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            thresholds_hours: default_thresholds(),
            at_risk_percent: default_at_risk_percent(),
        }
    }
}

fn default_thresholds() -> BTreeMap<TicketPriority, f64> {
    BTreeMap::from([
        (TicketPriority::Critical, 4.0),
        (TicketPriority::High, 8.0),
        (TicketPriority::Medium, 24.0),
        (TicketPriority::Low, 72.0),
    ])
}

fn default_at_risk_percent() -> f64 {
    80.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRulesConfig {
    /// A health drop alert needs the new score below this floor.
    #[serde(default = "default_health_drop_floor")]
    pub health_drop_floor: i32,

    /// ...and at least this many points below the previous snapshot.
    #[serde(default = "default_health_drop_min_delta")]
    pub health_drop_min_delta: i32,

    /// Lookahead windows for contract expiry, in days.
    #[serde(default = "default_contract_windows")]
    pub contract_windows_days: Vec<i64>,

    #[serde(default = "default_true")]
    pub churn_risk_enabled: bool,
}

impl Default for AlertRulesConfig {
    fn default() -> Self {
        Self {
            health_drop_floor: default_health_drop_floor(),
            health_drop_min_delta: default_health_drop_min_delta(),
            contract_windows_days: default_contract_windows(),
            churn_risk_enabled: true,
        }
    }
}

fn default_health_drop_floor() -> i32 {
    70
}

fn default_health_drop_min_delta() -> i32 {
    5
}

fn default_contract_windows() -> Vec<i64> {
    vec![30, 60, 90]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Customers scored more recently than this are skipped for the cycle.
    #[serde(default = "default_min_recompute_interval_secs")]
    pub min_recompute_interval_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_concurrency: default_max_concurrency(),
            min_recompute_interval_secs: default_min_recompute_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_max_concurrency() -> usize {
    8
}

fn default_min_recompute_interval_secs() -> i64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_stock_thresholds() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.sla.threshold_hours(TicketPriority::Critical).unwrap(), 4.0);
        assert_eq!(config.sla.threshold_hours(TicketPriority::High).unwrap(), 8.0);
        assert_eq!(config.sla.threshold_hours(TicketPriority::Medium).unwrap(), 24.0);
        assert_eq!(config.sla.threshold_hours(TicketPriority::Low).unwrap(), 72.0);
        assert_eq!(config.alerts.contract_windows_days, vec![30, 60, 90]);
        assert_eq!(config.scheduler.max_concurrency, 8);
    }

    #[test]
    fn partial_threshold_table_leaves_priorities_unconfigured() {
        let config = EngineConfig::from_toml(
            r#"
            [sla.thresholds_hours]
            critical = 2.0
            high = 6.0
            "#,
        )
        .unwrap();
        assert_eq!(config.sla.threshold_hours(TicketPriority::Critical).unwrap(), 2.0);
        assert!(matches!(
            config.sla.threshold_hours(TicketPriority::Low),
            Err(EngineError::UnconfiguredPriority(priority)) if priority == "low"
        ));
    }

    #[test]
    fn rejects_non_positive_threshold() {
        let err = EngineConfig::from_toml(
            r#"
            [sla.thresholds_hours]
            medium = 0.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn rejects_empty_contract_windows() {
        let err = EngineConfig::from_toml(
            r#"
            [alerts]
            contract_windows_days = []
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn missing_file_path_means_defaults() {
        let config = EngineConfig::load(None).unwrap();
        assert_eq!(config.alerts.health_drop_floor, 70);
        assert_eq!(config.scheduler.interval_secs, 3600);
    }
}
