use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Another writer already holds the open alert for this pair.
    #[error("an open {alert_type} alert already exists for {}", customer_label(.customer_id))]
    Conflict {
        customer_id: Option<Uuid>,
        alert_type: String,
    },

    /// Another writer moved the ticket between read and write on every attempt.
    #[error("ticket {ticket_number} kept changing concurrently")]
    TicketConflict { ticket_number: String },

    #[error("no SLA threshold configured for priority '{0}'")]
    UnconfiguredPriority(String),

    #[error("snapshot for customer {customer_id} is not newer than the latest stored snapshot")]
    SnapshotOutOfOrder { customer_id: Uuid },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. }
                | EngineError::TicketConflict { .. }
                | EngineError::SnapshotOutOfOrder { .. }
        )
    }
}

fn customer_label(customer_id: &Option<Uuid>) -> String {
    match customer_id {
        Some(id) => format!("customer {id}"),
        None => "the system scope".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
