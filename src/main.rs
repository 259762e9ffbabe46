use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

mod account;
mod cache;
mod card;
mod config;
mod error;
mod fsutil;
mod ids;
mod mailer;
mod poller;
mod preset;
mod quota;
mod session;
mod store;

use account::AccountService;
use cache::SnapshotCache;
use card::CardRegistry;
use config::AppConfig;
use ids::Email;
use mailer::LogMailer;
use poller::SchedulePoller;
use preset::{Preset, Schedule};
use session::LockController;
use store::{HttpStore, RemoteStore};

/// Card-gated app lock
///
/// Restricts selected applications until an authorized card is presented,
/// a schedule ends, or an emergency tapout is spent.
#[derive(Parser, Debug)]
#[command(name = "taplock")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the device configuration
    Setup {
        /// Account email this device belongs to
        #[arg(long)]
        account: String,

        /// Base URL of the hosted store (HTTPS)
        #[arg(long)]
        store_url: String,

        /// Operator email allowed to modify the card whitelist
        #[arg(long)]
        operator: String,
    },
    /// Account management
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },
    /// Operator-only administration
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
    /// Card registration
    Card {
        #[command(subcommand)]
        command: CardCommands,
    },
    /// Blocking presets
    Preset {
        #[command(subcommand)]
        command: PresetCommands,
    },
    /// Start a manual lock session
    Lock {
        /// Manual preset template to apply
        #[arg(long)]
        preset: Option<Uuid>,
    },
    /// End a manual lock session
    Unlock,
    /// Spend one emergency tapout to end the active session
    Tapout,
    /// Show lock, quota and membership status
    Status {
        /// Pull a fresh snapshot from the store
        #[arg(long)]
        refresh: bool,
    },
    /// Run the schedule poller and display tick
    Daemon,
}

#[derive(Subcommand, Debug)]
enum AccountCommands {
    /// Create an account and send a signup code
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Verify a one-time code
    Verify {
        #[arg(long)]
        email: String,
        code: String,
    },
    /// Send a fresh one-time code (signin / password reset)
    RequestCode {
        #[arg(long)]
        email: String,
    },
    /// Delete the configured account and everything it owns
    Delete,
}

#[derive(Subcommand, Debug)]
enum AdminCommands {
    /// Add a card id to the whitelist
    WhitelistAdd { card: String },
}

#[derive(Subcommand, Debug)]
enum CardCommands {
    /// Bind a whitelisted card to the configured account
    Register { card: String },
    /// Clear the account's card binding
    Unregister,
}

#[derive(Subcommand, Debug)]
enum PresetCommands {
    /// Create a preset. With --start/--end it is a one-shot window, with
    /// --days/--from/--to a recurring rule, otherwise manual.
    Add {
        name: String,

        /// Apps to block, comma separated
        #[arg(long, value_delimiter = ',')]
        apps: Vec<String>,

        /// Window start (RFC 3339)
        #[arg(long)]
        start: Option<String>,

        /// Window end (RFC 3339)
        #[arg(long)]
        end: Option<String>,

        /// Days of week, comma separated (mon,tue,...)
        #[arg(long, value_delimiter = ',')]
        days: Vec<String>,

        /// Daily start time (HH:MM)
        #[arg(long)]
        from: Option<String>,

        /// Daily end time (HH:MM); may be earlier than --from to wrap
        /// past midnight
        #[arg(long)]
        to: Option<String>,
    },
    /// List the account's presets
    List,
    /// Delete a preset
    Remove { id: Uuid },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => config::get_config_path()?,
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
    runtime.block_on(dispatch(args.command, config_path))
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "taplock=debug" } else { "taplock=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}

async fn dispatch(command: Commands, config_path: PathBuf) -> Result<()> {
    if let Commands::Setup {
        account,
        store_url,
        operator,
    } = command
    {
        let config = AppConfig {
            account,
            store_url,
            operator,
            poll: Default::default(),
        };
        config::save_config(&config_path, &config)?;
        println!("Configuration written to {}", config_path.display());
        return Ok(());
    }

    let app = App::load(&config_path)?;

    match command {
        Commands::Setup { .. } => unreachable!("handled above"),
        Commands::Account { command } => run_account_command(&app, command).await,
        Commands::Admin { command } => run_admin_command(&app, command).await,
        Commands::Card { command } => run_card_command(&app, command).await,
        Commands::Preset { command } => run_preset_command(&app, command).await,
        Commands::Lock { preset } => {
            let controller = app.controller().await?;
            controller.lock_manual(preset, Utc::now()).await?;
            println!("Locked.");
            Ok(())
        }
        Commands::Unlock => {
            let controller = app.controller().await?;
            controller.unlock().await?;
            println!("Unlocked.");
            Ok(())
        }
        Commands::Tapout => {
            let controller = app.controller().await?;
            let record = controller.tapout(Utc::now()).await?;
            println!("Session ended by tapout (interrupted: {:?}).", record.interrupted);
            Ok(())
        }
        Commands::Status { refresh } => {
            let controller = app.controller().await?;
            let snapshot = controller.status(refresh).await?;
            println!("Lock: {:?}", snapshot.lock);
            println!("{}", poller::countdown_summary(&snapshot, Utc::now()));
            Ok(())
        }
        Commands::Daemon => run_daemon(&app).await,
    }
}

/// Shared command context: config plus the store-backed services.
struct App {
    config: AppConfig,
    store: Arc<dyn RemoteStore>,
    cache: Arc<SnapshotCache>,
}

impl App {
    fn load(config_path: &PathBuf) -> Result<Self> {
        let config = config::load_config(config_path)?;
        let store: Arc<dyn RemoteStore> = Arc::new(HttpStore::new(&config.store_url)?);
        let cache = Arc::new(SnapshotCache::new(store.clone()));
        Ok(Self {
            config,
            store,
            cache,
        })
    }

    fn account(&self) -> Result<Email> {
        Ok(Email::parse(&self.config.account)?)
    }

    fn operator(&self) -> Result<Email> {
        Ok(Email::parse(&self.config.operator)?)
    }

    fn accounts(&self) -> AccountService {
        AccountService::new(self.store.clone(), Arc::new(LogMailer))
    }

    fn registry(&self) -> Result<CardRegistry> {
        Ok(CardRegistry::new(self.store.clone(), self.operator()?))
    }

    async fn controller(&self) -> Result<LockController> {
        Ok(LockController::connect(self.account()?, self.store.clone(), self.cache.clone()).await?)
    }
}

async fn run_account_command(app: &App, command: AccountCommands) -> Result<()> {
    let service = app.accounts();
    match command {
        AccountCommands::Signup { email, password } => {
            let email = service.signup(&email, &password).await?;
            println!("Account {email} created; check your inbox for the code.");
        }
        AccountCommands::Verify { email, code } => {
            service.verify_code(&email, &code).await?;
            println!("Code verified.");
        }
        AccountCommands::RequestCode { email } => {
            let email = Email::parse(&email)?;
            service.issue_code(&email).await?;
            println!("Code sent to {email}.");
        }
        AccountCommands::Delete => {
            let account = app.account()?;
            // Deleting an account is a mutation; the gatekeeper rejects
            // it while any session is active.
            let controller = app.controller().await?;
            controller.guard_mutation().await?;
            service.delete_account(&account).await?;
            println!("Account {account} deleted (whitelist entries preserved).");
        }
    }
    Ok(())
}

async fn run_admin_command(app: &App, command: AdminCommands) -> Result<()> {
    let registry = app.registry()?;
    match command {
        AdminCommands::WhitelistAdd { card } => {
            let operator = app.operator()?;
            match registry.whitelist_add(&operator, &card).await? {
                card::WhitelistOutcome::Added => println!("Card whitelisted."),
                card::WhitelistOutcome::AlreadyListed => println!("Card already whitelisted."),
            }
        }
    }
    Ok(())
}

async fn run_card_command(app: &App, command: CardCommands) -> Result<()> {
    let registry = app.registry()?;
    let account = app.account()?;
    let controller = app.controller().await?;

    match command {
        CardCommands::Register { card } => {
            controller.guard_mutation().await?;
            let binding = registry.register_card(&account, &card).await?;
            println!("Card {} registered.", binding.card);
        }
        CardCommands::Unregister => {
            controller.guard_mutation().await?;
            registry.unregister_card(&account).await?;
            println!("Card unregistered; it remains whitelisted.");
        }
    }
    Ok(())
}

async fn run_preset_command(app: &App, command: PresetCommands) -> Result<()> {
    let controller = app.controller().await?;

    match command {
        PresetCommands::Add {
            name,
            apps,
            start,
            end,
            days,
            from,
            to,
        } => {
            let schedule = build_schedule(start, end, days, from, to)?;
            let preset = Preset::new(name, apps, schedule)?;
            let id = preset.id;
            controller.preset_save(preset).await?;
            println!("Preset created: {id}");
        }
        PresetCommands::List => {
            let presets = app.store.presets_list(controller.account()).await?;
            if presets.is_empty() {
                println!("No presets.");
            }
            for preset in presets {
                println!("{}  {}  {:?}", preset.id, preset.name, preset.schedule);
            }
        }
        PresetCommands::Remove { id } => {
            controller.preset_remove(id).await?;
            println!("Preset removed.");
        }
    }
    Ok(())
}

fn build_schedule(
    start: Option<String>,
    end: Option<String>,
    days: Vec<String>,
    from: Option<String>,
    to: Option<String>,
) -> Result<Schedule> {
    let has_window = start.is_some() || end.is_some();
    let has_recurrence = !days.is_empty() || from.is_some() || to.is_some();

    if has_window && has_recurrence {
        anyhow::bail!("A preset is either a one-shot window or a recurring rule, not both");
    }

    if has_window {
        let start = parse_instant(start.as_deref().context("--start is required with --end")?)?;
        let end = parse_instant(end.as_deref().context("--end is required with --start")?)?;
        return Ok(Schedule::Window { start, end });
    }

    if has_recurrence {
        if days.is_empty() {
            anyhow::bail!("--days is required for a recurring preset");
        }
        let days = days
            .iter()
            .map(|d| parse_weekday(d))
            .collect::<Result<Vec<Weekday>>>()?;
        let start = parse_time(from.as_deref().context("--from is required with --days")?)?;
        let end = parse_time(to.as_deref().context("--to is required with --days")?)?;
        return Ok(Schedule::Recurring { days, start, end });
    }

    Ok(Schedule::Manual)
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp (expected RFC 3339): {s}"))?
        .with_timezone(&Utc))
}

fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .with_context(|| format!("Invalid time (expected HH:MM): {s}"))
}

fn parse_weekday(s: &str) -> Result<Weekday> {
    s.parse::<Weekday>()
        .map_err(|_| anyhow::anyhow!("Invalid day name: {s}"))
}

async fn run_daemon(app: &App) -> Result<()> {
    let controller = Arc::new(app.controller().await?);
    let poll = &app.config.poll;

    info!(
        "Starting daemon (schedule poll every {}s, display tick every {}s)",
        poll.schedule_poll_secs, poll.tick_secs
    );

    let poller = Arc::new(SchedulePoller::new(
        controller.clone(),
        poll.schedule_poll_secs,
        poll.jitter_secs,
    ));

    // Display tick: recompute countdowns from cached timestamps, no I/O.
    let tick_secs = poll.tick_secs;
    let tick_controller = controller.clone();
    let tick = tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(tick_secs)).await;
            if let Ok(snapshot) = tick_controller.status(false).await {
                info!("{}", poller::countdown_summary(&snapshot, Utc::now()));
            }
        }
    });

    tokio::select! {
        result = poller.run() => {
            tick.abort();
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            poller.stop().await;
            tick.abort();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_schedule_defaults_to_manual() {
        let schedule = build_schedule(None, None, vec![], None, None).unwrap();
        assert_eq!(schedule, Schedule::Manual);
    }

    #[test]
    fn build_schedule_window() {
        let schedule = build_schedule(
            Some("2026-09-01T08:00:00Z".into()),
            Some("2026-09-01T09:00:00Z".into()),
            vec![],
            None,
            None,
        )
        .unwrap();
        assert!(matches!(schedule, Schedule::Window { .. }));
    }

    #[test]
    fn build_schedule_recurring() {
        let schedule = build_schedule(
            None,
            None,
            vec!["mon".into(), "wed".into()],
            Some("21:00".into()),
            Some("06:30".into()),
        )
        .unwrap();
        match schedule {
            Schedule::Recurring { days, start, end } => {
                assert_eq!(days, vec![Weekday::Mon, Weekday::Wed]);
                assert_eq!(start, NaiveTime::parse_from_str("21:00", "%H:%M").unwrap());
                assert_eq!(end, NaiveTime::parse_from_str("06:30", "%H:%M").unwrap());
            }
            other => panic!("expected recurring schedule, got {other:?}"),
        }
    }

    #[test]
    fn build_schedule_rejects_mixed_kinds() {
        let result = build_schedule(
            Some("2026-09-01T08:00:00Z".into()),
            Some("2026-09-01T09:00:00Z".into()),
            vec!["mon".into()],
            Some("21:00".into()),
            Some("22:00".into()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn parse_weekday_accepts_abbreviations() {
        assert_eq!(parse_weekday("mon").unwrap(), Weekday::Mon);
        assert_eq!(parse_weekday("sunday").unwrap(), Weekday::Sun);
        assert!(parse_weekday("funday").is_err());
    }
}
