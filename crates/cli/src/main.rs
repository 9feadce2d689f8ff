use std::{
    cell::Cell,
    path::PathBuf,
    process::ExitCode,
    time::Instant,
};

use anyhow::Context;
use calendar::CalendarFile;
use clap::{Args, Parser, Subcommand};
use classifier::{CommandClassifier, RuleClassifier};
use core_model::{Classifier, Field, SyncError};
use mailbox::MailboxDir;
use reconcile::{CyclePhase, Reconciler, SyncContext};
use store_sqlite::SqliteStore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod ui;

use config::Config;

/// Header written by `init` on an empty store.
const DEFAULT_HEADER: [&str; 12] = [
    "Name",
    "Email",
    "Company",
    "Meeting Status",
    "Meeting Date",
    "Meeting Time",
    "Last Contact",
    "Team Member",
    "Calendar Link",
    "Meet Link",
    "Needs Response",
    "Notes",
];

#[derive(Parser)]
#[command(name = "contact-sync")]
#[command(about = "Keeps a contact sheet in step with monitored mailboxes and calendars")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Config file to use instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store and write the default header if it has none.
    Init,
    /// Poll continuously until interrupted.
    Watch,
    /// Run a single incremental cycle.
    Sync,
    Backfill(BackfillArgs),
    /// Answer a question about the current contacts.
    Ask { question: String },
    FillEmpty,
    Redo(RedoArgs),
    Doctor,
}

#[derive(Args)]
struct BackfillArgs {
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(i64).range(1..=ingest::MAX_WINDOW_DAYS))]
    days: i64,
    /// Remove every row before re-ingesting.
    #[arg(long, default_value_t = false)]
    clear: bool,
}

#[derive(Args)]
struct RedoArgs {
    #[arg(long, value_delimiter = ',', required = true)]
    fields: Vec<Field>,
    #[arg(long)]
    guidance: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let fatal = err
                .downcast_ref::<SyncError>()
                .is_some_and(SyncError::is_fatal);
            error!(fatal, error = %format!("{err:#}"), "contact-sync failed");
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let t = Instant::now();
    let config = Config::load(cli.config.as_deref())?;
    info!(accounts = config.settings.accounts.len(), "config loaded");

    info!("opening database");
    let mut store = match &config.store_path {
        Some(path) => SqliteStore::open(path)?,
        None => SqliteStore::open_default()?,
    };
    store.init_schema()?;

    if matches!(cli.command, Commands::Init) {
        let header: Vec<String> = DEFAULT_HEADER.iter().map(|h| h.to_string()).collect();
        if store.ensure_header(&header)? {
            info!(columns = header.len(), elapsed = ?t.elapsed(), "header written");
            println!("initialized with {} columns", header.len());
        } else {
            info!(elapsed = ?t.elapsed(), "header already present");
            println!("store already initialized");
        }
        return Ok(());
    }
    if matches!(cli.command, Commands::Doctor) {
        let report = doctor(&config, &store).await?;
        info!(problems = report.problems.len(), elapsed = ?t.elapsed(), "doctor done");
        ui::print_doctor(&report);
        return Ok(());
    }

    let messages = MailboxDir::new(config.mail_root()).with_retention_days(config.retention_days);
    let calendar = CalendarFile::new(config.calendar_path(), &config.account_addresses());
    let classifier = build_classifier(&config);
    let label = command_label(&cli.command);
    let mut reconciler = Reconciler::new(
        &messages,
        &calendar,
        classifier.as_ref(),
        &mut store,
        config.settings.clone(),
    )
    .on_progress(progress_logger(label));
    let mut ctx = SyncContext::new();

    match cli.command {
        Commands::Init | Commands::Doctor => {}
        Commands::Watch => {
            let (handle, token) = reconcile::cancellation();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("shutdown requested; finishing current cycle");
                handle.cancel();
            });
            info!(every = ?config.poll_interval, "watching");
            let cycles = reconciler
                .watch(&mut ctx, config.poll_interval, token)
                .await?;
            println!("stopped after {cycles} cycle(s)");
        }
        Commands::Sync => {
            let summary = reconciler.run_cycle(&mut ctx).await?;
            ui::print_summary(label, &summary);
        }
        Commands::Backfill(args) => {
            info!(days = args.days, clear = args.clear, "backfilling");
            let summary = reconciler.backfill(args.days, args.clear, &mut ctx).await?;
            ui::print_summary(label, &summary);
        }
        Commands::Ask { question } => {
            info!(question = %question, "asking");
            let answer = reconciler.ask(&question, &mut ctx).await?;
            ui::print_answer(&answer);
        }
        Commands::FillEmpty => {
            let summary = reconciler.fill_empty(&mut ctx).await?;
            ui::print_summary(label, &summary);
        }
        Commands::Redo(args) => {
            let summary = reconciler
                .redo(&args.fields, args.guidance.as_deref(), &mut ctx)
                .await?;
            ui::print_summary(label, &summary);
        }
    }
    info!(command = label, elapsed = ?t.elapsed(), "done");
    Ok(())
}

fn command_label(command: &Commands) -> &'static str {
    match command {
        Commands::Init => "init",
        Commands::Watch => "watch",
        Commands::Sync => "sync",
        Commands::Backfill(_) => "backfill",
        Commands::Ask { .. } => "ask",
        Commands::FillEmpty => "fill-empty",
        Commands::Redo(_) => "redo",
        Commands::Doctor => "doctor",
    }
}

fn build_classifier(config: &Config) -> Box<dyn Classifier> {
    match config.classifier_command.split_first() {
        Some((program, args)) => {
            info!(program = %program, "using external classifier");
            Box::new(
                CommandClassifier::new(program.clone(), args.to_vec(), config.classifier_key.clone())
                    .with_timeout(config.classifier_timeout),
            )
        }
        None => {
            info!(keywords = config.target_keywords.len(), "using rule classifier");
            Box::new(RuleClassifier::new(
                &config.target_keywords,
                &config.account_addresses(),
            ))
        }
    }
}

/// Logs each phase with the time since the cycle started and since the
/// previous phase.
fn progress_logger(name: &'static str) -> impl Fn(CyclePhase) {
    let started = Cell::new(Instant::now());
    let last = Cell::new(Instant::now());
    move |phase| {
        let now = Instant::now();
        if matches!(phase, CyclePhase::Polling { .. }) {
            started.set(now);
        }
        let delta = now.duration_since(last.replace(now));
        let elapsed = now.duration_since(started.get());
        match phase {
            CyclePhase::Polling { account_count } => {
                info!(name, account_count, elapsed = ?elapsed, delta = ?delta, "polling accounts")
            }
            CyclePhase::Grouping { message_count } => {
                info!(name, message_count, elapsed = ?elapsed, delta = ?delta, "grouping messages")
            }
            CyclePhase::Reconciling { counterpart_count } => {
                info!(
                    name,
                    counterpart_count,
                    elapsed = ?elapsed,
                    delta = ?delta,
                    "reconciling counterparts"
                )
            }
            CyclePhase::Presenting => {
                info!(name, elapsed = ?elapsed, delta = ?delta, "sorting and highlighting")
            }
            CyclePhase::Done { processed } => {
                info!(name, processed, elapsed = ?elapsed, delta = ?delta, "cycle done")
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => warn!(error = %err, "cannot listen for SIGTERM"),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c; watch runs until killed");
        std::future::pending::<()>().await;
    }
}

async fn doctor(config: &Config, store: &SqliteStore) -> anyhow::Result<ui::DoctorReport> {
    info!("running integrity check");
    let mut report = ui::DoctorReport {
        integrity: store.integrity_check()?,
        rows: store.row_count()?,
        ..ui::DoctorReport::default()
    };
    if report.integrity != "ok" {
        report.problems.push("sqlite integrity check failed".to_string());
    }

    let header = store.header().context("reading header")?;
    if header.iter().all(|h| h.trim().is_empty()) {
        report
            .problems
            .push("store has no header row; run `contact-sync init`".to_string());
    } else {
        let map = schema::discover(&header);
        for field in Field::ALL {
            match map.column(field) {
                Some(col) => report.bound.push((field, header[col].clone())),
                None => report.unbound.push(field),
            }
        }
        report.unmapped = map
            .unmapped_columns()
            .into_iter()
            .map(|c| header[c].clone())
            .collect();
        if !map.is_bound(Field::Email) {
            report
                .problems
                .push("no email column; contacts cannot be matched".to_string());
        }
    }

    let cursors = store.cursors()?;
    for account in &config.settings.accounts {
        let dir = config.mail_root().join(&account.address);
        let present = tokio::fs::try_exists(&dir).await.unwrap_or(false);
        if !present {
            report
                .problems
                .push(format!("no mailbox directory at {}", dir.display()));
        }
        report.accounts.push((
            account.address.clone(),
            cursors.get(&account.address).cloned(),
            present,
        ));
    }
    report.calendar_present = tokio::fs::try_exists(config.calendar_path())
        .await
        .unwrap_or(false);
    report.classifier = match config.classifier_command.first() {
        Some(program) => format!("command `{program}`"),
        None => format!("rules ({} keyword(s))", config.target_keywords.len()),
    };
    Ok(report)
}
