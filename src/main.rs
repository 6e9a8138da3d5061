use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tagmill::background::PeriodicTask;
use tagmill::config::Settings;
use tagmill::feeds;
use tagmill::librarian;
use tagmill::loader::FeedsLoader;
use tagmill::ontology::{self, BasicNormalizer, TagNormalizer};
use tagmill::openai_provider::OpenAiProvider;
use tagmill::processors;
use tagmill::resources;
use tagmill::provider::ProviderInterface;
use tagmill::rotator::{PgRotationStore, RotationStore};
use tagmill::types::{Error, Feed, FeedState};
use tagmill::worker::EntriesProcessor;

#[derive(Parser)]
#[command(name = "tagmill", about = "Feed ingestion and tag processing service")]
struct Cli {
    /// Path to a JSON settings file. Defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the feed loader and all enabled processors until interrupted.
    Serve,

    /// Register a feed url, optionally attached to a collection or a user.
    AddFeed {
        url: String,

        #[arg(long)]
        collection: Option<Uuid>,

        #[arg(long)]
        user: Option<Uuid>,
    },

    /// Move failed entries back into a processor's queue for another try.
    ReplayFailed {
        processor_id: i32,

        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// Print a feed's state and last recorded error.
    ShowFeed { feed_id: Uuid },

    /// List the tags applied to one entry.
    EntryTags { entry_id: Uuid },

    /// Print a user's spend ledger, one line per billing interval.
    UserLedger { user_id: Uuid },
}

async fn connect(settings: &Settings) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&settings.database_url)
        .await
        .map_err(Error::from)?;

    sqlx::migrate!().run(&pool).await.map_err(Error::from)?;

    Ok(pool)
}

async fn serve(settings: Settings, pool: PgPool) -> anyhow::Result<()> {
    let loader = FeedsLoader::new(pool.clone(), settings.loader.clone())?;

    loader.proxies().restore_states(&pool).await?;

    let provider: Arc<dyn ProviderInterface> = Arc::new(OpenAiProvider::new(&settings.llm)?);
    let store: Arc<dyn RotationStore> = Arc::new(PgRotationStore::new(pool.clone()));
    let normalizer: Arc<dyn TagNormalizer> = Arc::new(BasicNormalizer);

    let mut tasks = Vec::new();

    let mut loader_task = PeriodicTask::new(
        "loader",
        Duration::from_secs_f64(settings.loader.delay_between_runs_secs),
        Arc::new(loader),
    );
    loader_task.start(true);
    tasks.push(loader_task);

    for config in settings.processors.iter().filter(|config| config.enabled) {
        let processor = processors::build_processor(config, provider.clone(), store.clone())?;

        let worker = EntriesProcessor::new(
            pool.clone(),
            config.clone(),
            settings.librarian.clone(),
            processor,
            normalizer.clone(),
        );

        let mut task = PeriodicTask::new(
            format!("processor_{}", config.name),
            Duration::from_secs_f64(settings.librarian.delay_between_runs_secs),
            Arc::new(worker),
        );
        task.start(true);
        tasks.push(task);
    }

    info!(tasks = tasks.len(), "service_started");

    tokio::signal::ctrl_c().await?;

    info!("shutdown_requested");

    for task in &mut tasks {
        task.stop().await;
    }

    Ok(())
}

async fn add_feed(pool: PgPool, url: String, collection: Option<Uuid>, user: Option<Uuid>) -> anyhow::Result<()> {
    let feed = Feed {
        id: Uuid::new_v4(),
        source_id: Uuid::new_v4(),
        url: url.clone(),
        state: FeedState::NotLoaded,
        last_error: None,
        load_attempted_at: None,
        loaded_at: None,
        title: None,
        description: None,
    };

    feeds::save_feed(&pool, &feed).await?;

    // The url may already be registered; attachments go to whichever feed
    // row owns it now.
    let feed = feeds::get_feed_by_url(&pool, &url)
        .await?
        .ok_or_else(|| Error::General(format!("feed was not saved: {}", url)))?;

    if let Some(collection_id) = collection {
        feeds::add_feed_to_collection(&pool, feed.id, collection_id).await?;
    }

    if let Some(user_id) = user {
        feeds::link_feed_to_user(&pool, feed.id, user_id).await?;
    }

    println!("feed {} registered as {}", feed.url, feed.id);

    Ok(())
}

async fn replay_failed(pool: PgPool, processor_id: i32, limit: i64) -> anyhow::Result<()> {
    let moved = librarian::move_failed_entries_to_processor_queue(&pool, processor_id, limit).await?;

    let remaining = librarian::count_failed_entries(&pool, processor_id).await?;

    println!("moved {} failed entries back to the queue, {} remaining", moved, remaining);

    Ok(())
}

async fn show_feed(pool: PgPool, feed_id: Uuid) -> anyhow::Result<()> {
    let Some(feed) = feeds::get_feed(&pool, feed_id).await? else {
        println!("no feed with id {}", feed_id);
        return Ok(());
    };

    println!("url: {}", feed.url);
    println!("state: {}", feed.state.as_str());
    println!("title: {}", feed.title.as_deref().unwrap_or("-"));

    match feed.last_error {
        Some(error) => println!("last error: {}", error.as_str()),
        None => println!("last error: -"),
    }

    match feed.loaded_at {
        Some(loaded_at) => println!("loaded at: {}", loaded_at),
        None => println!("loaded at: never"),
    }

    Ok(())
}

async fn entry_tags(pool: PgPool, entry_id: Uuid) -> anyhow::Result<()> {
    let tags = ontology::entry_tags(&pool, entry_id).await?;

    if tags.is_empty() {
        println!("no tags for entry {}", entry_id);
        return Ok(());
    }

    for tag in tags {
        println!("{}", tag);
    }

    Ok(())
}

async fn user_ledger(pool: PgPool, user_id: Uuid) -> anyhow::Result<()> {
    let history = resources::load_resource_history(&pool, user_id, resources::KIND_TOKENS_COST).await?;

    if history.is_empty() {
        println!("no ledger records for user {}", user_id);
        return Ok(());
    }

    for resource in history {
        println!(
            "{}: used {:.6} usd, reserved {:.6} usd",
            resource.interval_started_at.format("%Y-%m"),
            resource.used.to_usd(),
            resource.reserved.to_usd(),
        );
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())?;

    let pool = connect(&settings).await?;

    match cli.command {
        Command::Serve => serve(settings, pool).await,
        Command::AddFeed { url, collection, user } => add_feed(pool, url, collection, user).await,
        Command::ReplayFailed { processor_id, limit } => replay_failed(pool, processor_id, limit).await,
        Command::ShowFeed { feed_id } => show_feed(pool, feed_id).await,
        Command::EntryTags { entry_id } => entry_tags(pool, entry_id).await,
        Command::UserLedger { user_id } => user_ledger(pool, user_id).await,
    }
}
