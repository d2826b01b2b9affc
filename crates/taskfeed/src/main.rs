use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use taskfeed_core::{
    classifier::{
        forwarder::{ClassificationForwarder, ForwarderConfig},
        types::OpenCodeConfig,
    },
    config::{self, Config},
    ingest::{IngestOptions, Ingestor, RunReport},
    source::pager::{PageFetcher, PagerConfig},
    store::{MessageStore, StoredMessageRecord},
    text::truncate_chars,
};
use taskfeed_discord::DiscordClient;
use taskfeed_opencode::OpenCodeClassifier;

#[derive(Parser)]
#[command(
    name = "taskfeed",
    version,
    about = "Pull recent channel messages, store them, and hand them to opencode for task triage"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one ingestion pass (default)
    Run,
    /// Show the newest stored messages
    Recent {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Show store statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<(), taskfeed_core::Error> {
    taskfeed_core::logging::init("taskfeed")?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_ingestion().await,
        Commands::Recent { limit } => show_recent(limit),
        Commands::Stats => show_stats(),
    }
}

async fn run_ingestion() -> Result<(), taskfeed_core::Error> {
    // Missing credentials fail here, before any work starts.
    let cfg = Config::load()?;
    tracing::info!(
        channel = %cfg.channel_id,
        database = %cfg.database_path.display(),
        lookback_secs = cfg.lookback.as_secs(),
        "configuration loaded"
    );

    let source = Arc::new(DiscordClient::from_config(&cfg)?);
    let classifier = Arc::new(OpenCodeClassifier::new(OpenCodeConfig::from(&cfg)));
    let store = MessageStore::open(&cfg.database_path)?;

    let mut ingestor = Ingestor::new(
        store,
        PageFetcher::new(source, PagerConfig::from(&cfg)),
        ClassificationForwarder::new(classifier, ForwarderConfig::from(&cfg)),
        IngestOptions::from(&cfg),
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; stopping at the next safe point");
                cancel.cancel();
            }
        });
    }
    if let Some(limit) = cfg.run_timeout {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            tracing::warn!("run deadline of {limit:?} reached; stopping");
            cancel.cancel();
        });
    }

    let report = ingestor.run_once(Utc::now(), &cancel).await?;
    print_report(&report);
    Ok(())
}

fn print_report(r: &RunReport) {
    println!("Channel: {}", r.channel);
    println!("Fetched since: {}", r.threshold.to_rfc3339());
    println!(
        "Fetched {} messages, saved {} new ({} already stored, {} failed)",
        r.fetched, r.inserted, r.duplicates, r.failed_rows
    );
    println!(
        "Forwarded {} messages ({} failed)",
        r.forwarded,
        r.forward_failures.len()
    );
    if r.cancelled {
        println!("Run was cancelled before all messages were forwarded");
    }
}

fn open_store_read_side() -> Result<MessageStore, taskfeed_core::Error> {
    let store = MessageStore::open(config::load_database_path())?;
    store.ensure_schema()?;
    Ok(store)
}

fn show_recent(limit: usize) -> Result<(), taskfeed_core::Error> {
    let store = open_store_read_side()?;
    let rows = store.recent(limit)?;
    if rows.is_empty() {
        println!("No messages found in {}", store.path());
        return Ok(());
    }

    println!("Last {} messages:", rows.len());
    for rec in &rows {
        println!("{}", format_record(rec));
    }
    Ok(())
}

fn show_stats() -> Result<(), taskfeed_core::Error> {
    let store = open_store_read_side()?;
    let stats = store.stats(Utc::now().date_naive())?;

    println!("=== Store statistics ({}) ===", store.path());
    println!("Total messages: {}", stats.total);
    println!("Messages today (UTC): {}", stats.on_day);
    println!("Top {} authors:", stats.top_authors.len());
    for (author, count) in &stats.top_authors {
        println!("  {author}: {count} messages");
    }
    Ok(())
}

fn format_record(rec: &StoredMessageRecord) -> String {
    let preview = truncate_chars(&rec.content, 100);
    format!(
        "[{}] {}: {} (attachments: {})",
        rec.timestamp.format("%Y-%m-%d %H:%M:%S"),
        rec.author_name,
        preview.replace('\n', " "),
        rec.attachment_count
    )
}
