use clap::Parser;
use std::error::Error;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use replyguy::action::{ActionExecutor, DryRunSurface, HumanPacedExecutor};
use replyguy::approval::StdinApproval;
use replyguy::config::{Config, LoggingConfig};
use replyguy::filter::ContentFilter;
use replyguy::generator::LlmReplyGenerator;
use replyguy::history::{HistoryStore, JsonlHistoryStore};
use replyguy::llm::LLMClient;
use replyguy::orchestrator::{Orchestrator, RunSettings};
use replyguy::session::{FileSessionStore, SessionHandle, SessionStore};
use replyguy::source::{FeedFileSource, PostSource};

const DEFAULT_CONFIG: &str = "replyguy.toml";

/// ReplyGuy - replies to feed posts with human pacing, durable dedup and rate limits
#[derive(Parser, Debug)]
#[command(name = "replyguy", version, about)]
struct Args {
    /// Config file (TOML). `replyguy.toml` is used when present.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep running, one run every --interval minutes
    #[arg(long)]
    continuous: bool,

    /// Minutes between runs in continuous mode
    #[arg(short, long)]
    interval: Option<u64>,

    /// Maximum replies posted per run
    #[arg(short, long)]
    max_replies: Option<usize>,

    /// Confirm every reply on the terminal before posting
    #[arg(long)]
    manual_approval: bool,

    /// Run Chrome without a window
    #[arg(long)]
    headless: bool,

    /// Read candidate posts from a JSONL feed snapshot instead of the live feed
    #[arg(short, long)]
    feed: Option<PathBuf>,

    /// Go through the motions without posting anything
    #[arg(long)]
    dry_run: bool,

    /// Write logs to this file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print the N most recent history records and today's reply count, then exit
    #[arg(long, value_name = "N")]
    show_history: Option<usize>,
}

fn load_config(args: &Args) -> Result<Config, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => Config::from_file(DEFAULT_CONFIG)?,
        None => Config::default(),
    };

    // Command-line flags win over the file.
    if args.continuous {
        config.bot.continuous = true;
    }
    if let Some(minutes) = args.interval {
        config.bot.interval_minutes = minutes;
    }
    if let Some(max) = args.max_replies {
        config.bot.max_replies_per_run = max;
    }
    if args.manual_approval {
        config.bot.manual_approval = true;
    }
    if args.headless {
        config.browser.headless = true;
    }
    if let Some(path) = &args.log_file {
        config.logging.file = Some(path.clone());
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) -> Result<(), Box<dyn Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter);

    match &logging.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

/// Cancel on Ctrl+C or SIGTERM. The orchestrator stops between posts.
fn install_signal_handlers(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Ctrl+C received, stopping after the current step"),
            _ = terminate => info!("SIGTERM received, stopping after the current step"),
        }
        cancel.cancel();
    });
}

fn show_history(config: &Config, limit: usize) -> Result<(), Box<dyn Error>> {
    let store = JsonlHistoryStore::open(config.storage.history_path())?;
    println!(
        "Replies today: {} (all time: {})",
        store.count_today()?,
        store.posted_count()?
    );
    for record in store.recent(limit)? {
        println!(
            "{}  {:<17} {} @{}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.outcome.to_string(),
            record.post_id,
            record.author
        );
        if let Some(reply) = &record.reply_text {
            println!("    reply: {}", reply);
        }
        if let Some(detail) = &record.detail {
            println!("    detail: {}", detail);
        }
    }
    Ok(())
}

fn load_session(store: &FileSessionStore) -> Option<SessionHandle> {
    match store.load() {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "could not load saved session, continuing without it");
            None
        }
    }
}

#[cfg(feature = "browser")]
type ChromeGuard = replyguy::browser::ChromeSession;
#[cfg(not(feature = "browser"))]
type ChromeGuard = ();

/// Fill in whichever of source and executor is still missing from a live Chrome.
#[cfg(feature = "browser")]
async fn attach_chrome(
    config: &Config,
    sessions: &FileSessionStore,
    session: &mut Option<SessionHandle>,
    source: &mut Option<Box<dyn PostSource>>,
    executor: &mut Option<Box<dyn ActionExecutor>>,
) -> Result<Option<ChromeGuard>, Box<dyn Error>> {
    use replyguy::browser::{ChromeFeedSource, ChromeSession, ChromeSurface};

    if source.is_some() && executor.is_some() {
        return Ok(None);
    }

    let profile = config
        .browser
        .profile_dir
        .clone()
        .unwrap_or_else(|| config.storage.profile_dir());
    let chrome = ChromeSession::launch(&config.browser, profile)?;
    let handle = chrome.ensure_login(&config.browser, session.as_ref()).await?;
    if let Err(e) = sessions.save(&handle) {
        warn!(error = %e, "could not save session");
    }
    *session = Some(handle);

    if source.is_none() {
        *source = Some(Box::new(ChromeFeedSource::new(chrome.tab(), &config.browser)));
    }
    if executor.is_none() {
        *executor = Some(Box::new(HumanPacedExecutor::new(
            ChromeSurface::new(chrome.tab(), &config.browser),
            config.pacing.clone(),
        )));
    }
    Ok(Some(chrome))
}

#[cfg(not(feature = "browser"))]
async fn attach_chrome(
    _config: &Config,
    _sessions: &FileSessionStore,
    _session: &mut Option<SessionHandle>,
    _source: &mut Option<Box<dyn PostSource>>,
    _executor: &mut Option<Box<dyn ActionExecutor>>,
) -> Result<Option<ChromeGuard>, Box<dyn Error>> {
    Ok(None)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.logging)?;

    if let Some(limit) = args.show_history {
        return show_history(&config, limit);
    }

    info!(
        continuous = config.bot.continuous,
        max_replies = config.bot.max_replies_per_run,
        manual_approval = config.bot.manual_approval,
        dry_run = args.dry_run,
        "replyguy starting"
    );

    let history = JsonlHistoryStore::open(config.storage.history_path())?;
    let filter = ContentFilter::new(&config.filter);
    let client = LLMClient::from_config(&config.generator)?;
    let generator = LlmReplyGenerator::new(client, &config.generator, filter.clone());

    let sessions = FileSessionStore::new(config.storage.session_path());
    let mut session = load_session(&sessions);

    let mut source: Option<Box<dyn PostSource>> = args
        .feed
        .as_ref()
        .map(|path| Box::new(FeedFileSource::new(path)) as Box<dyn PostSource>);
    let mut executor: Option<Box<dyn ActionExecutor>> = if args.dry_run {
        Some(Box::new(HumanPacedExecutor::new(
            DryRunSurface::new(),
            config.pacing.clone(),
        )))
    } else {
        None
    };

    // Keeps the browser open for the lifetime of the orchestrator.
    let _chrome =
        attach_chrome(&config, &sessions, &mut session, &mut source, &mut executor).await?;

    let source = source.ok_or("no post source: pass --feed <file> or build with the `browser` feature")?;
    let executor =
        executor.ok_or("posting needs the `browser` feature; use --dry-run to rehearse")?;

    let cancel = CancellationToken::new();
    install_signal_handlers(cancel.clone());

    let mut orchestrator = Orchestrator::new(
        RunSettings::from(&config.bot),
        source,
        filter,
        Box::new(generator),
        executor,
        Box::new(history),
    )
    .with_cancellation(cancel);
    if config.bot.manual_approval {
        orchestrator = orchestrator.with_approval(Box::new(StdinApproval::stdin()));
    }

    let totals = orchestrator.run(session.as_ref()).await?;
    info!(
        runs = totals.runs,
        posted = totals.posted,
        failed = totals.failed,
        success_rate = totals.success_rate(),
        "stopped"
    );
    Ok(())
}
