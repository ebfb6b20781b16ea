use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::SlaConfig;
use crate::error::{EngineError, Result};
use crate::models::{Ticket, TicketPriority, TicketStatus};
use crate::store::Store;

const MAX_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SlaCheck {
    pub is_breached: bool,
    pub hours_open: f64,
    pub percent_of_threshold: f64,
    pub threshold_hours: f64,
    /// Still open, not breached, and past the at-risk share of the threshold.
    pub at_risk: bool,
}

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub customer_id: Option<Uuid>,
    pub subject: String,
    pub priority: TicketPriority,
}

/// Result of writing a ticket after a status change or inline check.
#[derive(Debug, Clone)]
pub struct TicketUpdate {
    pub ticket: Ticket,
    pub check: SlaCheck,
    pub newly_breached: bool,
}

pub fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 3_600_000.0
}

pub fn check_breach(ticket: &Ticket, sla: &SlaConfig, now: DateTime<Utc>) -> Result<SlaCheck> {
    let threshold_hours = sla.threshold_hours(ticket.priority)?;
    let end = ticket.resolved_at.unwrap_or(now);
    let hours_open = hours_between(ticket.created_at, end).max(0.0);
    let is_breached = hours_open > threshold_hours;
    let percent_of_threshold = (hours_open / threshold_hours * 100.0).min(100.0);

    Ok(SlaCheck {
        is_breached,
        hours_open,
        percent_of_threshold,
        threshold_hours,
        at_risk: ticket.status.is_open()
            && !is_breached
            && percent_of_threshold >= sla.at_risk_percent,
    })
}

/// Moves a ticket forward. Entering resolved (or closed straight from an open
/// state) fixes the resolution time and breach flag for good.
pub fn transition_status(
    ticket: &mut Ticket,
    to: TicketStatus,
    sla: &SlaConfig,
    now: DateTime<Utc>,
) -> Result<SlaCheck> {
    if to < ticket.status {
        return Err(EngineError::InvalidTransition {
            entity: "ticket",
            from: ticket.status.to_string(),
            to: to.to_string(),
        });
    }

    if ticket.status.is_open() && !to.is_open() {
        let check = check_breach(ticket, sla, now)?;
        ticket.resolved_at = Some(now);
        ticket.resolution_time_hours = Some(check.hours_open);
        ticket.sla_breached = check.is_breached;
        ticket.status = to;
        return Ok(check);
    }

    ticket.status = to;
    check_breach(ticket, sla, now)
}

/// Inline check for an open ticket. Returns true when this call flipped the
/// breach flag.
pub fn refresh_breach(
    ticket: &mut Ticket,
    sla: &SlaConfig,
    now: DateTime<Utc>,
) -> Result<(SlaCheck, bool)> {
    let check = check_breach(ticket, sla, now)?;
    if !ticket.status.is_open() {
        return Ok((check, false));
    }

    let newly_breached = check.is_breached && !ticket.sla_breached;
    if newly_breached {
        ticket.sla_breached = true;
    }
    Ok((check, newly_breached))
}

pub fn format_ticket_number(year: i32, month: u32, sequence: u32) -> String {
    format!("TKT-{year:04}{month:02}-{sequence:04}")
}

pub fn parse_ticket_number(value: &str) -> Result<(i32, u32, u32)> {
    let invalid = || EngineError::Validation(format!("'{value}' is not a TKT-YYYYMM-XXXX number"));

    let rest = value.strip_prefix("TKT-").ok_or_else(invalid)?;
    let (period, sequence) = rest.split_once('-').ok_or_else(invalid)?;
    if period.len() != 6 || sequence.len() < 4 {
        return Err(invalid());
    }

    let year: i32 = period[..4].parse().map_err(|_| invalid())?;
    let month: u32 = period[4..].parse().map_err(|_| invalid())?;
    let sequence: u32 = sequence.parse().map_err(|_| invalid())?;
    if !(1..=12).contains(&month) || sequence == 0 {
        return Err(invalid());
    }
    Ok((year, month, sequence))
}

/// Share of closed-out tickets that met their SLA, or `None` when nothing is resolved yet.
pub fn compliance_rate(tickets: &[Ticket]) -> Option<f64> {
    let resolved: Vec<&Ticket> = tickets
        .iter()
        .filter(|ticket| ticket.resolution_time_hours.is_some())
        .collect();
    if resolved.is_empty() {
        return None;
    }

    let within = resolved.iter().filter(|ticket| !ticket.sla_breached).count();
    Some(within as f64 / resolved.len() as f64 * 100.0)
}

pub async fn open_ticket<S: Store + ?Sized>(
    store: &S,
    fields: NewTicket,
    now: DateTime<Utc>,
) -> Result<Ticket> {
    if fields.subject.trim().is_empty() {
        return Err(EngineError::Validation("ticket subject is required".to_string()));
    }

    let sequence = store.next_ticket_sequence(now.year(), now.month()).await?;
    let ticket = Ticket {
        id: Uuid::new_v4(),
        ticket_number: format_ticket_number(now.year(), now.month(), sequence),
        customer_id: fields.customer_id,
        subject: fields.subject,
        priority: fields.priority,
        status: TicketStatus::Open,
        created_at: now,
        resolved_at: None,
        sla_breached: false,
        resolution_time_hours: None,
    };
    store.insert_ticket(&ticket).await?;
    tracing::info!(ticket = %ticket.ticket_number, priority = %ticket.priority, "ticket opened");
    Ok(ticket)
}

/// Read, transition, compare-and-set; re-reads when another writer got in first.
pub async fn update_status<S: Store + ?Sized>(
    store: &S,
    sla: &SlaConfig,
    ticket_id: Uuid,
    to: TicketStatus,
    now: DateTime<Utc>,
) -> Result<TicketUpdate> {
    let mut ticket_number = ticket_id.to_string();

    for _ in 0..MAX_WRITE_ATTEMPTS {
        let previous = store
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| EngineError::not_found("ticket", ticket_id))?;

        let mut ticket = previous.clone();
        let (_, newly_breached) = refresh_breach(&mut ticket, sla, now)?;
        let check = transition_status(&mut ticket, to, sla, now)?;

        if store.replace_ticket(&ticket, &previous).await? {
            return Ok(TicketUpdate {
                ticket,
                check,
                newly_breached,
            });
        }

        tracing::debug!(ticket = %ticket.ticket_number, "ticket changed concurrently, retrying");
        ticket_number = ticket.ticket_number;
    }

    Err(EngineError::TicketConflict { ticket_number })
}

pub async fn check_ticket<S: Store + ?Sized>(
    store: &S,
    sla: &SlaConfig,
    ticket_id: Uuid,
    now: DateTime<Utc>,
) -> Result<TicketUpdate> {
    let previous = store
        .get_ticket(ticket_id)
        .await?
        .ok_or_else(|| EngineError::not_found("ticket", ticket_id))?;

    let mut ticket = previous.clone();
    let (check, mut newly_breached) = refresh_breach(&mut ticket, sla, now)?;
    if newly_breached && !store.replace_ticket(&ticket, &previous).await? {
        newly_breached = false;
    }

    Ok(TicketUpdate {
        ticket,
        check,
        newly_breached,
    })
}

/// Periodic pass over open tickets. Returns the tickets this pass flagged as
/// breached; tickets that cannot be checked are logged and skipped.
pub async fn sweep_open_tickets<S: Store + ?Sized>(
    store: &S,
    sla: &SlaConfig,
    now: DateTime<Utc>,
) -> Result<Vec<TicketUpdate>> {
    let mut breached = Vec::new();

    for previous in store.list_open_tickets().await? {
        let mut ticket = previous.clone();
        let (check, newly_breached) = match refresh_breach(&mut ticket, sla, now) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(ticket = %previous.ticket_number, error = %err, "skipping SLA check");
                continue;
            }
        };

        if !newly_breached {
            continue;
        }

        if store.replace_ticket(&ticket, &previous).await? {
            tracing::info!(
                ticket = %ticket.ticket_number,
                hours_open = check.hours_open,
                threshold = check.threshold_hours,
                "ticket breached SLA"
            );
            breached.push(TicketUpdate {
                ticket,
                check,
                newly_breached,
            });
        }
    }

    Ok(breached)
}
