//! ROLLCALL — Multi-account auto check-in agent
//!
//! Entry point. Loads configuration and secrets, initialises
//! structured logging, wires the WAF cookie source and notification
//! dispatcher, runs one check-in pass over all accounts, and exits
//! with the scheduler contract code.

use anyhow::Result;
use chrono::Local;
use tracing::{error, info, warn};

use rollcall::client::HttpSessionFactory;
use rollcall::config::{self, AppConfig, RunTuning};
use rollcall::engine::aggregator::RunAggregator;
use rollcall::notify::Notifier;
use rollcall::waf::browser::BrowserWafSource;

const BANNER: &str = r#"
 ____   ___  _     _     ____    _    _     _
|  _ \ / _ \| |   | |   / ___|  / \  | |   | |
| |_) | | | | |   | |  | |     / _ \ | |   | |
|  _ <| |_| | |___| |__| |___ / ___ \| |___| |___
|_| \_\\___/|_____|_____\____/_/   \_\_____|_____|

  Resilient check-in runner for WAF-fronted providers
  v0.1.0 — Scheduled Agent
"#;

#[tokio::main]
async fn main() {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    init_logging();

    println!("{BANNER}");

    // A top-level interrupt aborts the whole run; sessions are scoped
    // per attempt so there is nothing else to clean up. The next
    // scheduled run starts from scratch.
    let exit_code = tokio::select! {
        outcome = run() => match outcome {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "Run aborted");
                1
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted by user");
            1
        }
    };

    std::process::exit(exit_code);
}

/// Execute one full check-in pass. Returns the process exit code.
async fn run() -> Result<i32> {
    info!(
        time = %Local::now().format("%Y-%m-%d %H:%M:%S"),
        "Multi-account auto check-in started"
    );

    // Configuration failures are fatal, before any account runs.
    let config = AppConfig::load("config.toml")?;
    info!(
        providers = config.providers.len(),
        "Loaded provider configuration(s)"
    );

    let accounts = config::load_accounts()?;
    if accounts.is_empty() {
        anyhow::bail!("No accounts configured");
    }
    info!(accounts = accounts.len(), "Found account configurations");

    let tuning = RunTuning::from_env();
    info!(
        max_retries = tuning.max_retries,
        retry_delay_secs = tuning.retry_delay.as_secs_f64(),
        account_delay_secs = tuning.account_delay.as_secs_f64(),
        "Run tuning"
    );

    // Constructed once here and threaded through explicitly.
    let notifier = Notifier::from_env();
    let waf = BrowserWafSource::from_env();
    let sessions = HttpSessionFactory;

    let aggregator = RunAggregator::new(&waf, &sessions, tuning);
    let report = aggregator.run(&config, &accounts).await;

    if report.need_notify {
        info!("Notification warranted (failures or balance changes)");
        println!("{}", report.notification_text);

        notifier.send_html_report("Check-in Report", &report).await;
        // Plain text to the remaining channels; skip email to avoid
        // double delivery.
        notifier
            .broadcast("Check-in Alert", &report.notification_text, true)
            .await;
    } else {
        info!("All accounts successful and no balance changes detected, notification skipped");
    }

    info!(
        success = report.summary.success_count,
        failed = report.summary.failed_count,
        total = report.summary.total,
        "Run complete"
    );

    Ok(report.exit_code())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rollcall=info"));

    let json_logging = std::env::var("ROLLCALL_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
