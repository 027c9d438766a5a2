use anyhow::Context;
use chrono::Local;
use clap::{Arg, ArgMatches, Command};
use log::LevelFilter;
use outreach_engine::delivery::{DeliveryPort, ResendDelivery};
use outreach_engine::dispatch::{self, BatchPlan, DoneReason, RunOutcome, RunReport};
use outreach_engine::operator::{self, StatusReport};
use outreach_engine::{CampaignConfig, Dispatcher, LeadStore, Ledger, LedgerLock};
use std::process;
use std::sync::Arc;
use tokio::sync::watch;

const EXIT_HALTED: i32 = 2;

#[tokio::main]
async fn main() {
    let matches = Command::new("outreach")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Warmup-aware cold outreach dispatcher")
        .long_about(
            "Outreach v0.1.0 - sends a fixed lead list at a warmup-limited pace:\n\
             • Week-indexed daily quota with plateau\n\
             • Bounce-rate circuit breaker that halts all sending\n\
             • Jittered sequential sends, each recorded before the next\n\
             • Crash-safe resumable SQLite ledger",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/outreach.yaml")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and lead store, then exit")
                .action(clap::ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("status")
                .about("Show ledger-derived campaign statistics")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .help("Print the status as JSON")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Execute one dispatch pass")
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .help("Show the batch that would be sent without sending or recording")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("record-bounce")
                .about("Mark an email as bounced; it is never selected again")
                .arg(Arg::new("email").required(true).value_name("EMAIL")),
        )
        .subcommand(
            Command::new("record-reply")
                .about("Mark a contacted email as having replied")
                .arg(Arg::new("email").required(true).value_name("EMAIL")),
        )
        .subcommand(
            Command::new("record-open")
                .about("Mark a send as opened by its tracking id")
                .arg(Arg::new("tracking-id").required(true).value_name("TRACKING_ID")),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/outreach.yaml");

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    let result = if matches.get_flag("test-config") {
        test_config(&config)
    } else {
        match matches.subcommand() {
            Some(("status", sub)) => show_status(&config, sub),
            Some(("run", sub)) => run_dispatch(&config, sub).await,
            Some(("record-bounce", sub)) => record_bounce(&config, sub),
            Some(("record-reply", sub)) => record_reply(&config, sub),
            Some(("record-open", sub)) => record_open(&config, sub),
            _ => {
                eprintln!("No command given. Try `outreach --help`.");
                process::exit(1);
            }
        }
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<CampaignConfig> {
    let mut config = if std::path::Path::new(path).exists() {
        CampaignConfig::from_file(path).with_context(|| format!("failed to parse {path}"))?
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        CampaignConfig::default()
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn generate_default_config(path: &str) {
    let config = CampaignConfig::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &CampaignConfig) -> anyhow::Result<i32> {
    println!("🔍 Testing configuration...");
    println!();
    config.validate(true)?;
    println!("  From: {}", config.from_header());
    println!("  Ledger: {}", config.ledger_path);
    match config.daily_email_limit_override {
        Some(limit) => println!("  Daily limit: {limit} (override, warmup table ignored)"),
        None => {
            println!("  Warmup schedule:");
            for week in 1..=config.warmup_schedule.last_week() {
                println!(
                    "    Week {week}: {} per day",
                    config.warmup_schedule.limit_for_week(week)
                );
            }
        }
    }
    println!(
        "  Delay: {}-{} ms, max bounce rate {:.1}%",
        config.min_delay_ms,
        config.max_delay_ms,
        config.max_bounce_rate * 100.0
    );
    let leads = LeadStore::load(&config.leads_path)?;
    println!("  Leads: {} from {}", leads.len(), config.leads_path);
    println!("✅ Configuration valid");
    Ok(0)
}

fn show_status(config: &CampaignConfig, args: &ArgMatches) -> anyhow::Result<i32> {
    let ledger = open_ledger_read_only(&config.ledger_path)?;
    let leads = match LeadStore::load(&config.leads_path) {
        Ok(leads) => Some(leads),
        Err(e) => {
            log::warn!("Lead store unavailable, remaining count omitted: {e}");
            None
        }
    };
    let status =
        operator::campaign_status(config, &ledger, leads.as_ref(), Local::now().date_naive())?;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(0)
}

fn print_status(status: &StatusReport) {
    let stats = &status.stats;
    println!("📊 Outreach Campaign Status");
    println!("═══════════════════════════════════════");
    println!();
    match stats.start_date {
        Some(start) => println!("  Started: {start} (week {})", stats.current_week),
        None => println!("  Started: not yet (first `run` sets the start date)"),
    }
    println!(
        "  Today ({}): {} of {} sent, {} remaining{}",
        status.today,
        status.sent_today,
        status.quota_today,
        status.remaining_today,
        if status.override_active {
            " [override]"
        } else {
            ""
        }
    );
    println!();
    println!("📈 Totals:");
    println!("  Total Sent: {}", stats.total_sent);
    if stats.total_sent > 0 {
        let pct = |n: u64| n as f64 / stats.total_sent as f64 * 100.0;
        println!(
            "  ├─ Bounced: {} ({:.1}%)",
            stats.total_bounced,
            pct(stats.total_bounced)
        );
        println!(
            "  ├─ Replied: {} ({:.1}%)",
            stats.total_replied,
            pct(stats.total_replied)
        );
        println!(
            "  └─ Opened: {} ({:.1}%)",
            stats.total_opened,
            pct(stats.total_opened)
        );
    }
    if let Some(remaining) = status.leads_remaining {
        println!("  Leads Remaining: {remaining}");
    }
    println!();
    if status.breaker.is_open() {
        println!(
            "🛑 Breaker OPEN: bounce rate {:.2}% exceeds {:.2}%. Sending is halted.",
            status.breaker.bounce_rate() * 100.0,
            status.max_bounce_rate * 100.0
        );
    } else {
        println!(
            "✅ Breaker closed: bounce rate {:.2}% (limit {:.2}%)",
            status.breaker.bounce_rate() * 100.0,
            status.max_bounce_rate * 100.0
        );
    }
}

async fn run_dispatch(config: &CampaignConfig, args: &ArgMatches) -> anyhow::Result<i32> {
    let dry_run = args.get_flag("dry-run");
    config.validate(!dry_run)?;
    let leads = LeadStore::load(&config.leads_path)?;

    if dry_run {
        let ledger = open_ledger_read_only(&config.ledger_path)?;
        let plan = dispatch::plan(config, &leads, &ledger, Local::now().date_naive())?;
        print_plan(&plan);
        return Ok(if plan.breaker.is_open() { EXIT_HALTED } else { 0 });
    }

    let _lock = LedgerLock::acquire(&config.ledger_path)?;
    let ledger = Ledger::open(&config.ledger_path)?;
    let api_key = config.delivery.api_key.clone().unwrap_or_default();
    let port: Arc<dyn DeliveryPort> = Arc::new(ResendDelivery::new(
        &config.delivery.api_base_url,
        &api_key,
        &config.from_header(),
        config.reply_to.clone(),
        config.delivery_timeout(),
    )?);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    log::info!("Starting dispatch pass...");
    let report = Dispatcher::new(config, &leads, &ledger, port)
        .run(&mut shutdown_rx)
        .await?;
    print_report(&report);

    Ok(match report.outcome {
        RunOutcome::Halted { .. } => EXIT_HALTED,
        _ => 0,
    })
}

fn print_plan(plan: &BatchPlan) {
    println!("🧪 Dry run for {} (campaign started {})", plan.today, plan.start_date);
    if plan.breaker.is_open() {
        println!(
            "🛑 Breaker OPEN at {:.2}% bounce rate: nothing would be sent",
            plan.breaker.bounce_rate() * 100.0
        );
        return;
    }
    println!(
        "  Quota {} | sent today {} | remaining {} | candidates {}",
        plan.quota, plan.sent_today, plan.remaining_quota, plan.candidates
    );
    if plan.batch.is_empty() {
        println!("  Nothing to send.");
    }
    for (i, lead) in plan.batch.iter().enumerate() {
        println!(
            "  {:>3}. {:<40} {} ({})",
            i + 1,
            lead.email,
            lead.clinic_name,
            lead.city
        );
    }
}

fn print_report(report: &RunReport) {
    match report.outcome {
        RunOutcome::Done(DoneReason::QuotaReached) => {
            println!(
                "⏸️  Daily limit reached ({} of {}), try again tomorrow",
                report.sent_today_before, report.quota
            );
        }
        RunOutcome::Done(DoneReason::NoCandidates) => {
            println!("📭 Every lead has been contacted or excluded");
        }
        RunOutcome::Done(DoneReason::BatchSent) => {
            println!("✅ Dispatch pass complete");
        }
        RunOutcome::Halted { bounce_rate } => {
            println!(
                "🛑 HALTED: bounce rate {:.2}% is over the limit. Investigate before resuming.",
                bounce_rate * 100.0
            );
        }
        RunOutcome::Cancelled => {
            println!("⚠️  Cancelled by shutdown signal; progress so far is recorded");
        }
    }
    println!(
        "  Sent {} | bounced {} | transient failures {}",
        report.sent, report.bounced, report.transient_failures
    );
    println!(
        "  Campaign totals: {} sent, {} bounced ({:.2}%)",
        report.stats.total_sent,
        report.stats.total_bounced,
        report.stats.bounce_rate() * 100.0
    );
}

fn record_bounce(config: &CampaignConfig, args: &ArgMatches) -> anyhow::Result<i32> {
    let email = required(args, "email")?;
    let _lock = LedgerLock::acquire(&config.ledger_path)?;
    let ledger = Ledger::open(&config.ledger_path)?;
    let leads = LeadStore::load(&config.leads_path).ok();
    let stats = operator::record_bounce(&ledger, leads.as_ref(), email, Local::now().date_naive())?;
    println!(
        "✅ Recorded bounce for {email}. Bounce rate now {:.2}%",
        stats.bounce_rate() * 100.0
    );
    Ok(0)
}

fn record_reply(config: &CampaignConfig, args: &ArgMatches) -> anyhow::Result<i32> {
    let email = required(args, "email")?;
    let _lock = LedgerLock::acquire(&config.ledger_path)?;
    let ledger = Ledger::open(&config.ledger_path)?;
    let stats = operator::record_reply(&ledger, email, Local::now().date_naive())?;
    println!(
        "✅ Recorded reply from {email}. {} replies so far",
        stats.total_replied
    );
    Ok(0)
}

fn record_open(config: &CampaignConfig, args: &ArgMatches) -> anyhow::Result<i32> {
    let tracking_id = required(args, "tracking-id")?;
    let _lock = LedgerLock::acquire(&config.ledger_path)?;
    let ledger = Ledger::open(&config.ledger_path)?;
    let email = operator::record_open(&ledger, tracking_id, Local::now().date_naive())?;
    println!("✅ Recorded open for {email}");
    Ok(0)
}

/// Readers never create the ledger. A campaign that has not run yet reads
/// as an empty in-memory ledger.
fn open_ledger_read_only(path: &str) -> anyhow::Result<Ledger> {
    match Ledger::open_read_only(path)
        .with_context(|| format!("failed to open ledger {path}"))?
    {
        Some(ledger) => Ok(ledger),
        None => {
            log::info!("No ledger at {path} yet, reporting an unstarted campaign");
            Ok(Ledger::open_in_memory()?)
        }
    }
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> anyhow::Result<&'a str> {
    args.get_one::<String>(name)
        .map(String::as_str)
        .with_context(|| format!("missing <{name}>"))
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
                    _ = sigterm.recv() => log::info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                log::warn!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Received Ctrl-C");
    }
}
