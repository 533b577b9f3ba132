use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use deposit_api::{
    config::{self, AppConfig},
    db::{self, DbPool},
    entities::{alert, deposit, movement},
    events::{Event, EventSender},
    services::{deposits::DepositService, AppServices, ServiceFactory},
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

const CLI_ACTOR: &str = "cli";

#[derive(Parser)]
#[command(name = "deposit-cli", about = "Deposit lifecycle and alert administration", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Run one reconciliation sweep and print its summary
    Sweep,
    #[command(subcommand)]
    Deposit(DepositCommands),
    #[command(subcommand)]
    Alerts(AlertCommands),
}

#[derive(Subcommand)]
enum DepositCommands {
    Show(DepositRef),
    History(DepositRef),
    Extend(ExtendArgs),
    Invoice(InvoiceArgs),
    Retire(RetireArgs),
}

#[derive(Subcommand)]
enum AlertCommands {
    Active(ActiveAlertsArgs),
    Resolve(ResolveAlertsArgs),
}

#[derive(Args)]
struct DepositRef {
    #[arg(help = "Deposit UUID or code (e.g. DEP-2025-0000001)")]
    deposit: String,
}

#[derive(Args)]
struct ExtendArgs {
    #[arg(help = "Deposit UUID or code")]
    deposit: String,
    #[arg(long, value_parser = parse_datetime, help = "New expiration date (YYYY-MM-DD or RFC 3339)")]
    to: DateTime<Utc>,
    #[arg(long, help = "Why the expiration is being extended")]
    reason: String,
}

#[derive(Args)]
struct InvoiceArgs {
    #[arg(help = "Deposit UUID or code")]
    deposit: String,
    #[arg(long, help = "Invoice reference to record")]
    invoice_ref: String,
    #[arg(long, value_parser = parse_datetime, help = "Invoice date; defaults to now")]
    invoiced_at: Option<DateTime<Utc>>,
    #[arg(long, help = "Note appended to the deposit")]
    notes: Option<String>,
}

#[derive(Args)]
struct RetireArgs {
    #[arg(help = "Deposit UUID or code")]
    deposit: String,
    #[arg(long, value_parser = parse_datetime, help = "Retirement date; defaults to now")]
    retired_at: Option<DateTime<Utc>>,
    #[arg(long, help = "Note appended to the deposit")]
    notes: Option<String>,
}

#[derive(Args)]
struct ActiveAlertsArgs {
    #[arg(long, default_value_t = 50, help = "Maximum number of alerts to list")]
    limit: u64,
}

#[derive(Args)]
struct ResolveAlertsArgs {
    #[arg(required = true, value_parser = clap::value_parser!(Uuid), help = "Alert identifiers")]
    ids: Vec<Uuid>,
    #[arg(long, help = "Resolution note")]
    note: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize().await?;

    match cli.command {
        Commands::Migrate => {
            db::run_migrations(&context.db)
                .await
                .context("failed to run migrations")?;
            println!("Migrations applied");
        }
        Commands::Sweep => {
            let summary = context
                .services
                .sweep
                .run()
                .await
                .context("sweep failed")?;
            if cli.json {
                print_json(&summary)?;
            } else {
                println!(
                    "Scanned {} deposits: {} states updated, {} expiration alerts, {} high-value alerts, {} resolved",
                    summary.deposits_scanned,
                    summary.states_updated,
                    summary.expiration_alerts_created,
                    summary.high_value_alerts_created,
                    summary.alerts_resolved
                );
                println!("Errors: {}", summary.errors.len());
                for err in &summary.errors {
                    println!(
                        "- {} [{}] {}",
                        err.deposit_code.as_deref().unwrap_or("-"),
                        err.code,
                        err.message
                    );
                }
            }
        }
        Commands::Deposit(command) => handle_deposit_command(&context, command, cli.json).await?,
        Commands::Alerts(command) => handle_alert_command(&context, command, cli.json).await?,
    }

    Ok(())
}

async fn handle_deposit_command(
    context: &CliContext,
    command: DepositCommands,
    json: bool,
) -> Result<()> {
    let deposits = context.services.deposits.as_ref();

    match command {
        DepositCommands::Show(args) => {
            let found = lookup_deposit(deposits, &args.deposit).await?;
            let view = deposits.view(found.id).await?;
            if json {
                print_json(&view)?;
            } else {
                render_deposit(&found);
                if let Some(days) = view.days_to_expiry {
                    println!("  days to expiry: {}", days);
                }
                if let Some(client) = &view.client {
                    println!("  client: {} ({})", client.name, client.code);
                }
            }
        }
        DepositCommands::History(args) => {
            let found = lookup_deposit(deposits, &args.deposit).await?;
            let history = deposits.history(found.id).await?;
            if json {
                print_json(&history)?;
            } else if history.is_empty() {
                println!("No movements recorded for {}", found.code);
            } else {
                history.iter().for_each(render_movement);
            }
        }
        DepositCommands::Extend(args) => {
            let found = lookup_deposit(deposits, &args.deposit).await?;
            let updated = deposits
                .extend_expiration(found.id, args.to, &args.reason, CLI_ACTOR)
                .await?;
            output_deposit(&updated, json)?;
        }
        DepositCommands::Invoice(args) => {
            let found = lookup_deposit(deposits, &args.deposit).await?;
            let updated = deposits
                .mark_invoiced(
                    found.id,
                    &args.invoice_ref,
                    args.invoiced_at,
                    args.notes,
                    CLI_ACTOR,
                )
                .await?;
            output_deposit(&updated, json)?;
        }
        DepositCommands::Retire(args) => {
            let found = lookup_deposit(deposits, &args.deposit).await?;
            let updated = deposits
                .mark_retired(found.id, args.retired_at, args.notes, CLI_ACTOR)
                .await?;
            output_deposit(&updated, json)?;
        }
    }

    Ok(())
}

async fn handle_alert_command(context: &CliContext, command: AlertCommands, json: bool) -> Result<()> {
    let alerts = context.services.alerts.as_ref();

    match command {
        AlertCommands::Active(args) => {
            let active = alerts.active(args.limit).await?;
            if json {
                print_json(&active)?;
            } else if active.is_empty() {
                println!("No open alerts");
            } else {
                active.iter().for_each(render_alert);
            }
        }
        AlertCommands::Resolve(args) => {
            let resolved = alerts.resolve_many(&args.ids, args.note).await?;
            if json {
                print_json(&serde_json::json!({ "resolved": resolved }))?;
            } else {
                println!("Resolved {} of {} alerts", resolved, args.ids.len());
            }
        }
    }

    Ok(())
}

async fn lookup_deposit(deposits: &DepositService, key: &str) -> Result<deposit::Model> {
    let found = match Uuid::parse_str(key) {
        Ok(id) => deposits.get(id).await,
        Err(_) => deposits.get_by_code(key).await,
    };
    found.map_err(|e| anyhow!("deposit {}: {}", key, e))
}

struct CliContext {
    _config: AppConfig,
    db: Arc<DbPool>,
    services: AppServices,
}

impl CliContext {
    async fn initialize() -> Result<Self> {
        let config = config::load_config().context("failed to load application config")?;
        config::init_tracing(&config.log_level, config.log_json);

        let db_pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;
        let db = Arc::new(db_pool);

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(32);
        let event_sender = Arc::new(EventSender::new(event_tx));

        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                debug!(target: "deposit_cli", event = ?event, "received async event");
            }
        });

        let services = ServiceFactory::new(db.clone(), event_sender, &config).build();

        Ok(Self {
            _config: config,
            db,
            services,
        })
    }
}

fn output_deposit(deposit: &deposit::Model, json: bool) -> Result<()> {
    if json {
        print_json(deposit)
    } else {
        render_deposit(deposit);
        Ok(())
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_deposit(deposit: &deposit::Model) {
    println!(
        "- Deposit {} • state {} • qty {} • total {} • expires {}",
        deposit.code,
        deposit.state.as_str(),
        deposit.quantity,
        deposit.total_value,
        deposit
            .expiration_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "never".to_string())
    );
}

fn render_movement(entry: &movement::Model) {
    println!(
        "- {} • {:?} • qty {} • {} • {}",
        entry.occurred_at.format("%Y-%m-%d %H:%M"),
        entry.movement_type,
        entry.quantity,
        entry.actor,
        entry.description
    );
}

fn render_alert(entry: &alert::Model) {
    println!(
        "- {} • {:?} • {} • {}",
        entry.id,
        entry.priority,
        entry.alert_type.as_str(),
        entry.title
    );
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("invalid date '{raw}', expected YYYY-MM-DD or RFC 3339"))
}
