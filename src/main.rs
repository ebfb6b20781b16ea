use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

mod alerts;
mod config;
mod error;
mod models;
mod scheduler;
mod scoring;
mod sla;
mod store;

use crate::alerts::{BulkOutcome, NewFollowUp, Resolution, Signal, Snooze};
use crate::config::EngineConfig;
use crate::models::{
    AlertFilter, AlertSeverity, AlertStatus, AlertType, HistoryQuery, NewAlert, TicketPriority,
    TicketStatus,
};
use crate::scheduler::Scheduler;
use crate::sla::{NewTicket, TicketUpdate};
use crate::store::{PgStore, Store};

#[derive(Parser)]
#[command(name = "health-engine")]
#[command(about = "Customer health scoring, alerting and SLA tracking", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML); built-in defaults when omitted
    #[arg(long, env = "HEALTH_ENGINE_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample customers and signals
    Seed,
    /// Import customer signals from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run one scoring, alerting and SLA pass
    Sweep,
    /// Run sweeps on the configured interval until interrupted
    Run,
    /// Show a customer's score history, most recent first
    Score {
        #[arg(long)]
        customer: Uuid,
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Support tickets and SLA checks
    Ticket {
        #[command(subcommand)]
        command: TicketCommand,
    },
    /// Alert lifecycle
    Alerts {
        #[command(subcommand)]
        command: AlertCommand,
    },
}

#[derive(Subcommand)]
enum TicketCommand {
    /// Open a ticket and assign the next TKT number
    Open {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        priority: TicketPriority,
        #[arg(long)]
        customer: Option<Uuid>,
    },
    /// Move a ticket forward (in_progress, resolved, closed)
    Status {
        number: String,
        #[arg(long)]
        to: TicketStatus,
    },
    /// Evaluate a ticket against its SLA now
    Check { number: String },
    /// Share of a customer's resolved tickets that met SLA
    Compliance {
        #[arg(long)]
        customer: Uuid,
    },
}

#[derive(Subcommand)]
enum AlertCommand {
    List {
        #[arg(long)]
        status: Option<AlertStatus>,
        #[arg(long)]
        severity: Option<AlertSeverity>,
        #[arg(long = "type")]
        alert_type: Option<AlertType>,
        #[arg(long)]
        customer: Option<Uuid>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Raise a manual alert
    Create {
        #[arg(long = "type")]
        alert_type: AlertType,
        #[arg(long)]
        severity: AlertSeverity,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        customer: Option<Uuid>,
        #[arg(long)]
        value: Option<f64>,
        #[arg(long)]
        threshold: Option<f64>,
    },
    Resolve {
        id: Uuid,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        by: Option<String>,
        /// Record a follow-up action with this title
        #[arg(long)]
        follow_up: Option<String>,
        #[arg(long, requires = "follow_up")]
        follow_up_due: Option<DateTime<Utc>>,
    },
    Snooze {
        id: Uuid,
        #[arg(long)]
        until: DateTime<Utc>,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        by: Option<String>,
    },
    BulkResolve {
        #[arg(required = true)]
        ids: Vec<Uuid>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        by: Option<String>,
    },
    BulkSnooze {
        #[arg(required = true)]
        ids: Vec<Uuid>,
        #[arg(long)]
        until: DateTime<Utc>,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        by: Option<String>,
    },
    /// Open alerts per severity
    Summary,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("failed to load config")?;

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let json = cli.json;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let scheduler = Scheduler::new(store.clone(), config.clone());

    match cli.command {
        Commands::InitDb => {
            store::postgres::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            store::postgres::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = store::postgres::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} signal rows from {}.", csv.display());
        }
        Commands::Sweep => {
            let report = scheduler.run_sweep(Utc::now()).await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "Scored {} customers ({} skipped, {} failed); {} alerts raised, {} snoozes reactivated, {} tickets breached.",
                    report.customers_scored,
                    report.customers_skipped,
                    report.customers_failed,
                    report.alerts_raised,
                    report.snoozes_reactivated,
                    report.tickets_breached
                );
            }
        }
        Commands::Run => {
            tracing::info!(
                interval_secs = config.scheduler.interval_secs,
                "health engine v{} running",
                env!("CARGO_PKG_VERSION")
            );
            scheduler.run_forever().await?;
        }
        Commands::Score {
            customer,
            from,
            to,
            limit,
            offset,
        } => {
            let query = HistoryQuery {
                from,
                to,
                limit,
                offset,
            };
            let history = store.snapshot_history(customer, &query).await?;

            if json {
                print_json(&history)?;
            } else if history.is_empty() {
                println!("No health scores recorded for this customer.");
            } else {
                for snapshot in &history {
                    println!(
                        "- {} score {} ({}, {})",
                        snapshot.calculated_at.format("%Y-%m-%d %H:%M"),
                        snapshot.overall_score(),
                        snapshot.risk_level(),
                        snapshot.trend
                    );
                }
            }
        }
        Commands::Ticket { command } => {
            run_ticket_command(command, store.as_ref(), &scheduler, &config, json).await?;
        }
        Commands::Alerts { command } => {
            run_alert_command(command, &scheduler, json).await?;
        }
    }

    Ok(())
}

async fn run_ticket_command(
    command: TicketCommand,
    store: &dyn Store,
    scheduler: &Scheduler,
    config: &EngineConfig,
    json: bool,
) -> anyhow::Result<()> {
    let now = Utc::now();

    match command {
        TicketCommand::Open {
            subject,
            priority,
            customer,
        } => {
            config.sla.threshold_hours(priority)?;
            let ticket = sla::open_ticket(
                store,
                NewTicket {
                    customer_id: customer,
                    subject,
                    priority,
                },
                now,
            )
            .await?;
            if json {
                print_json(&ticket)?;
            } else {
                println!("Opened {} ({}).", ticket.ticket_number, ticket.priority);
            }
        }
        TicketCommand::Status { number, to } => {
            let ticket_id = ticket_id_for(store, &number).await?;
            let update = sla::update_status(store, &config.sla, ticket_id, to, now).await?;
            escalate_if_breached(scheduler, &update).await?;
            print_ticket_update(&update, json)?;
        }
        TicketCommand::Check { number } => {
            let ticket_id = ticket_id_for(store, &number).await?;
            let update = sla::check_ticket(store, &config.sla, ticket_id, now).await?;
            escalate_if_breached(scheduler, &update).await?;
            print_ticket_update(&update, json)?;
        }
        TicketCommand::Compliance { customer } => {
            let tickets = store.list_customer_tickets(customer).await?;
            let rate = sla::compliance_rate(&tickets);
            if json {
                print_json(&serde_json::json!({
                    "customer_id": customer,
                    "tickets": tickets.len(),
                    "compliance_rate": rate,
                }))?;
            } else {
                match rate {
                    Some(rate) => println!(
                        "{rate:.1}% of resolved tickets met SLA ({} tickets total).",
                        tickets.len()
                    ),
                    None => println!("No resolved tickets for this customer yet."),
                }
            }
        }
    }

    Ok(())
}

async fn ticket_id_for(store: &dyn Store, number: &str) -> anyhow::Result<Uuid> {
    sla::parse_ticket_number(number)?;
    let ticket = store
        .find_ticket_by_number(number)
        .await?
        .with_context(|| format!("ticket {number} not found"))?;
    Ok(ticket.id)
}

async fn escalate_if_breached(scheduler: &Scheduler, update: &TicketUpdate) -> anyhow::Result<()> {
    if !update.newly_breached {
        return Ok(());
    }

    let signal = Signal::SlaBreached {
        ticket: &update.ticket,
        check: &update.check,
    };
    for alert in scheduler.alerts().evaluate(signal, Utc::now()).await? {
        println!("Escalation alert {} raised.", alert.id);
    }
    Ok(())
}

fn print_ticket_update(update: &TicketUpdate, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&serde_json::json!({
            "ticket": update.ticket,
            "check": update.check,
            "newly_breached": update.newly_breached,
        }));
    }

    let check = &update.check;
    println!(
        "{} [{}] {:.1}h open of {:.1}h ({:.0}%){}{}",
        update.ticket.ticket_number,
        update.ticket.status,
        check.hours_open,
        check.threshold_hours,
        check.percent_of_threshold,
        if check.is_breached { ", BREACHED" } else { "" },
        if check.at_risk { ", at risk" } else { "" }
    );
    Ok(())
}

async fn run_alert_command(
    command: AlertCommand,
    scheduler: &Scheduler,
    json: bool,
) -> anyhow::Result<()> {
    let engine = scheduler.alerts();
    let now = Utc::now();

    match command {
        AlertCommand::List {
            status,
            severity,
            alert_type,
            customer,
            limit,
            offset,
        } => {
            let filter = AlertFilter {
                status,
                severity,
                alert_type,
                customer_id: customer,
                limit,
                offset,
            };
            let alerts = engine.list(&filter).await?;
            if json {
                print_json(&alerts)?;
            } else if alerts.is_empty() {
                println!("No alerts match.");
            } else {
                for alert in &alerts {
                    let mut note = String::new();
                    if alert.is_snoozed() {
                        if let Some(until) = alert.snoozed_until {
                            note = format!(" (until {})", until.format("%Y-%m-%d %H:%M"));
                        }
                    } else if alert.is_resolved() {
                        if let Some(by) = &alert.resolved_by {
                            note = format!(" (by {by})");
                        }
                    }
                    println!(
                        "- {} [{} {}{}] {}: {}",
                        alert.id, alert.severity, alert.status, note, alert.alert_type, alert.title
                    );
                }
            }
        }
        AlertCommand::Create {
            alert_type,
            severity,
            title,
            description,
            customer,
            value,
            threshold,
        } => {
            let alert = engine
                .create(
                    NewAlert {
                        customer_id: customer,
                        alert_type,
                        severity,
                        title,
                        description,
                        triggered_value: value,
                        threshold,
                    },
                    now,
                )
                .await?;
            if json {
                print_json(&alert)?;
            } else {
                println!("Created alert {}.", alert.id);
            }
        }
        AlertCommand::Resolve {
            id,
            notes,
            by,
            follow_up,
            follow_up_due,
        } => {
            let resolution = Resolution {
                notes,
                resolved_by: by,
                follow_up: follow_up.map(|title| NewFollowUp {
                    title,
                    due_at: follow_up_due,
                }),
            };
            let alert = engine.resolve(id, &resolution, now).await?;
            if json {
                print_json(&alert)?;
            } else {
                println!("Alert {} is {}.", alert.id, alert.status);
            }
        }
        AlertCommand::Snooze {
            id,
            until,
            reason,
            by,
        } => {
            let snooze = Snooze {
                until,
                reason,
                snoozed_by: by,
            };
            let alert = engine.snooze(id, &snooze, now).await?;
            if json {
                print_json(&alert)?;
            } else {
                println!("Alert {} snoozed until {}.", alert.id, until.to_rfc3339());
            }
        }
        AlertCommand::BulkResolve { ids, notes, by } => {
            let resolution = Resolution {
                notes,
                resolved_by: by,
                follow_up: None,
            };
            let outcome = engine.bulk_resolve(&ids, &resolution, now).await?;
            print_bulk_outcome(&outcome, json)?;
        }
        AlertCommand::BulkSnooze {
            ids,
            until,
            reason,
            by,
        } => {
            let snooze = Snooze {
                until,
                reason,
                snoozed_by: by,
            };
            let outcome = engine.bulk_snooze(&ids, &snooze, now).await?;
            print_bulk_outcome(&outcome, json)?;
        }
        AlertCommand::Summary => {
            let counts = engine.summary().await?;
            if json {
                print_json(&counts)?;
            } else {
                for severity in AlertSeverity::ALL {
                    let count = counts
                        .iter()
                        .find(|entry| entry.severity == severity)
                        .map_or(0, |entry| entry.count);
                    println!("{severity}: {count}");
                }
            }
        }
    }

    Ok(())
}

fn print_bulk_outcome(outcome: &BulkOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(outcome);
    }
    println!(
        "{} updated, {} unchanged, {} rejected, {} not found.",
        outcome.updated.len(),
        outcome.unchanged.len(),
        outcome.rejected.len(),
        outcome.not_found.len()
    );
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
