use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{CustomerSignals, HealthScoreSnapshot, RiskLevel, SubScores, Trend};

/// Sub-score weights in percent, in field order. They sum to 100.
pub const PRODUCT_ADOPTION_WEIGHT: i32 = 15;
pub const SUPPORT_HEALTH_WEIGHT: i32 = 25;
pub const ENGAGEMENT_WEIGHT: i32 = 20;
pub const FINANCIAL_HEALTH_WEIGHT: i32 = 20;
pub const SLA_COMPLIANCE_WEIGHT: i32 = 20;

pub fn clamp_sub_score(value: Option<i32>) -> i32 {
    value.unwrap_or(0).clamp(0, 100)
}

pub fn normalize(signals: &CustomerSignals) -> SubScores {
    SubScores {
        product_adoption: clamp_sub_score(signals.product_adoption),
        support_health: clamp_sub_score(signals.support_health),
        engagement: clamp_sub_score(signals.engagement),
        financial_health: clamp_sub_score(signals.financial_health),
        sla_compliance: clamp_sub_score(signals.sla_compliance),
    }
}

/// Weighted composite, rounded half-up. Integer arithmetic keeps .5 exact.
pub fn weighted_score(scores: &SubScores) -> i32 {
    let weighted = PRODUCT_ADOPTION_WEIGHT * scores.product_adoption.clamp(0, 100)
        + SUPPORT_HEALTH_WEIGHT * scores.support_health.clamp(0, 100)
        + ENGAGEMENT_WEIGHT * scores.engagement.clamp(0, 100)
        + FINANCIAL_HEALTH_WEIGHT * scores.financial_health.clamp(0, 100)
        + SLA_COMPLIANCE_WEIGHT * scores.sla_compliance.clamp(0, 100);

    (weighted + 50) / 100
}

impl RiskLevel {
    pub fn from_score(score: i32) -> RiskLevel {
        match score {
            80.. => RiskLevel::Low,
            60..=79 => RiskLevel::Medium,
            40..=59 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }
}

pub fn determine_trend(current: i32, previous: Option<&HealthScoreSnapshot>) -> Trend {
    let Some(previous) = previous else {
        return Trend::Stable;
    };

    match current.cmp(&previous.overall_score()) {
        std::cmp::Ordering::Greater => Trend::Improving,
        std::cmp::Ordering::Less => Trend::Declining,
        std::cmp::Ordering::Equal => Trend::Stable,
    }
}

pub fn compute(
    signals: &CustomerSignals,
    previous: Option<&HealthScoreSnapshot>,
    calculated_at: DateTime<Utc>,
) -> HealthScoreSnapshot {
    let sub_scores = normalize(signals);
    let trend = determine_trend(weighted_score(&sub_scores), previous);

    HealthScoreSnapshot {
        id: Uuid::new_v4(),
        customer_id: signals.customer_id,
        calculated_at,
        sub_scores,
        trend,
    }
}
