//! mailsift CLI: run pipeline stages, manage watchers, replay the DLQ.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::{Parser, Subcommand, ValueEnum};
use miette::Result;

use mailsift::broker::{ALL_STREAMS, RedisBroker, StreamBroker};
use mailsift::config::{Config, SubjectGateMode};
use mailsift::embed::{EmbeddingClient, HttpEmbeddingClient};
use mailsift::error::MailsiftResult;
use mailsift::llm::{HttpLlmClient, LlmClient};
use mailsift::mail::ImapMailSource;
use mailsift::stages::classifier::Classifier;
use mailsift::stages::filter::SemanticFilter;
use mailsift::stages::normalizer::Normalizer;
use mailsift::stages::persister::Persister;
use mailsift::stages::poller::{LlmSubjectGate, PassAllGate, Poller, SubjectGate};
use mailsift::stages::replayer::{DlqMonitor, replay};
use mailsift::stages::{EventHandler, Worker};
use mailsift::storage::{HttpStorage, Storage};
use mailsift::watchers::{DEFAULT_EXPANSIONS, DEFAULT_THRESHOLD, create_watcher_bundle};

#[derive(Parser)]
#[command(name = "mailsift", version, about = "Email-intent routing pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one pipeline stage (or every stage in one process).
    Run {
        #[arg(value_enum)]
        stage: Stage,
    },

    /// Manage watchers.
    Watcher {
        #[command(subcommand)]
        action: WatcherAction,
    },

    /// Re-inject dead-lettered entries back onto their source stream.
    Replay {
        /// Source stream whose DLQ to drain.
        #[arg(long, value_enum)]
        stream: StreamArg,

        /// Maximum entries to re-inject.
        #[arg(long, default_value = "100")]
        max: usize,
    },
}

#[derive(Subcommand)]
enum WatcherAction {
    /// Create a watcher: embed the seed query and expand it into prototypes.
    Add {
        /// Watcher name (e.g. "Billing").
        #[arg(long)]
        name: String,

        /// What emails to match, in natural language.
        #[arg(long)]
        query: String,

        /// Mailbox to watch (defaults to IMAP_USER).
        #[arg(long)]
        mailbox: Option<String>,

        /// Similarity threshold in [0, 1].
        #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: f64,

        /// LLM paraphrase prototypes to generate (0 disables expansion).
        #[arg(long, default_value_t = DEFAULT_EXPANSIONS)]
        expansions: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Stage {
    Poller,
    Normalizer,
    Filter,
    Classifier,
    Persister,
    Replayer,
    All,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StreamArg {
    Raw,
    Normalized,
    ToClassify,
    Classified,
}

impl StreamArg {
    fn name(self) -> &'static str {
        match self {
            Self::Raw => mailsift::broker::STREAM_RAW,
            Self::Normalized => mailsift::broker::STREAM_NORMALIZED,
            Self::ToClassify => mailsift::broker::STREAM_TO_CLASSIFY,
            Self::Classified => mailsift::broker::STREAM_CLASSIFIED,
        }
    }
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .build(),
        )
    }))
    .ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Run { stage } => run_stage(stage, &config)?,
        Commands::Watcher {
            action:
                WatcherAction::Add {
                    name,
                    query,
                    mailbox,
                    threshold,
                    expansions,
                },
        } => watcher_add(&config, &name, &query, mailbox, threshold, expansions)?,
        Commands::Replay { stream, max } => {
            let broker = connect_broker(&config)?;
            let replayed = replay(broker.as_ref(), stream.name(), max)?;
            println!("re-injected {replayed} entries onto {}", stream.name());
        }
    }

    Ok(())
}

// ── Client construction ─────────────────────────────────────────────────

fn connect_broker(config: &Config) -> MailsiftResult<Arc<dyn StreamBroker>> {
    Ok(Arc::new(RedisBroker::connect(&config.broker.url())?))
}

fn connect_storage(config: &Config) -> MailsiftResult<Arc<dyn Storage>> {
    Ok(Arc::new(HttpStorage::new(config.storage()?.clone())))
}

fn connect_llm(config: &Config) -> MailsiftResult<Arc<dyn LlmClient>> {
    Ok(Arc::new(HttpLlmClient::new(config.llm()?.clone())))
}

fn connect_embedder(config: &Config) -> MailsiftResult<Arc<dyn EmbeddingClient>> {
    Ok(Arc::new(HttpEmbeddingClient::new(config.embed()?.clone())))
}

// ── Stage dispatch ──────────────────────────────────────────────────────

/// Workers run until the process is killed; the flag exists so embedding
/// callers (and tests) can stop them.
fn never_shutdown() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

fn run_stage(stage: Stage, config: &Config) -> MailsiftResult<()> {
    match stage {
        Stage::Poller => run_poller(config),
        Stage::Normalizer => {
            let broker = connect_broker(config)?;
            run_worker(config, broker.clone(), Normalizer::new(broker))
        }
        Stage::Filter => {
            let broker = connect_broker(config)?;
            let storage = connect_storage(config)?;
            let embedder = if config.cache_only {
                None
            } else {
                Some(connect_embedder(config)?)
            };
            run_worker(
                config,
                broker.clone(),
                SemanticFilter::new(broker, storage, embedder, config.cache_only),
            )
        }
        Stage::Classifier => {
            let broker = connect_broker(config)?;
            let llm = connect_llm(config)?;
            run_worker(config, broker.clone(), Classifier::new(broker, llm))
        }
        Stage::Persister => {
            let broker = connect_broker(config)?;
            let storage = connect_storage(config)?;
            run_worker(config, broker, Persister::new(storage))
        }
        Stage::Replayer => run_replayer(config),
        Stage::All => run_all(config),
    }
}

fn run_worker<H: EventHandler>(
    config: &Config,
    broker: Arc<dyn StreamBroker>,
    handler: H,
) -> MailsiftResult<()> {
    Worker::new(broker, handler, config.dlq_max_deliveries, never_shutdown()).run()
}

fn run_poller(config: &Config) -> MailsiftResult<()> {
    let imap = config.imap()?.clone();
    let broker = connect_broker(config)?;
    let storage = connect_storage(config)?;
    let gate: Box<dyn SubjectGate> = match config.subject_gate {
        SubjectGateMode::Off => Box::new(PassAllGate),
        SubjectGateMode::Llm => Box::new(LlmSubjectGate::new(connect_llm(config)?)),
    };

    let mut poller = Poller::new(
        imap.user.clone(),
        imap.provider_override.clone(),
        Box::new(ImapMailSource::new(imap)),
        broker,
        storage,
        gate,
        config.scan.clone(),
        config.worker_pool_size,
        never_shutdown(),
    )?;
    poller.run()
}

/// One monitor worker per pipeline stream's DLQ.
fn run_replayer(config: &Config) -> MailsiftResult<()> {
    let mut handles = Vec::new();
    for stream in ALL_STREAMS {
        let config = config.clone();
        handles.push(std::thread::spawn(move || -> MailsiftResult<()> {
            let broker = connect_broker(&config)?;
            let result = run_worker(&config, broker, DlqMonitor::new(stream));
            if let Err(e) = &result {
                tracing::error!(service = "dlq_replayer", stream, error = %e, "monitor exited");
            }
            result
        }));
    }
    join_all(handles)
}

/// Every stage role in one process, each on its own thread with its own
/// broker connection.
fn run_all(config: &Config) -> MailsiftResult<()> {
    let mut handles = Vec::new();
    for stage in [
        Stage::Poller,
        Stage::Normalizer,
        Stage::Filter,
        Stage::Classifier,
        Stage::Persister,
        Stage::Replayer,
    ] {
        let config = config.clone();
        handles.push(std::thread::spawn(move || -> MailsiftResult<()> {
            let result = run_stage(stage, &config);
            if let Err(e) = &result {
                tracing::error!(?stage, error = %e, "stage exited");
            }
            result
        }));
    }
    join_all(handles)
}

fn join_all(
    handles: Vec<std::thread::JoinHandle<MailsiftResult<()>>>,
) -> MailsiftResult<()> {
    let mut first_error = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => first_error = first_error.or(Some(e)),
            Err(_) => tracing::error!("stage thread panicked"),
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// ── Watcher creation ────────────────────────────────────────────────────

fn watcher_add(
    config: &Config,
    name: &str,
    query: &str,
    mailbox: Option<String>,
    threshold: f64,
    expansions: usize,
) -> MailsiftResult<()> {
    let mailbox_id = match mailbox {
        Some(m) => m,
        None => config.imap()?.user.clone(),
    };

    let storage = connect_storage(config)?;
    let embedder = connect_embedder(config)?;
    // Expansion is best-effort; without LLM credentials the seed is the only
    // prototype.
    let llm = if expansions > 0 {
        connect_llm(config).ok()
    } else {
        None
    };

    let bundle = create_watcher_bundle(
        &*storage,
        &*embedder,
        llm.as_deref(),
        &mailbox_id,
        name,
        query,
        threshold,
        expansions,
    )?;

    println!(
        "created watcher {} ({}) for {} at threshold {:.2}",
        bundle.watcher.name, bundle.watcher.id, mailbox_id, threshold
    );
    println!("prototypes:");
    for prototype in &bundle.prototypes {
        println!("- {prototype}");
    }
    Ok(())
}
