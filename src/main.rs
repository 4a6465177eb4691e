// This is the entry point of the listing moderator.
//
// **Architecture Overview:**
// - `core/` = Business logic (moderation pipeline, no I/O details)
// - `infra/` = Implementations of core traits (SQLite, HTTP classifiers)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Translate the command line into moderation jobs
// 4. Wait for the background queue to drain

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with several mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "infra/infra_layer.rs"]
mod infra;

use crate::core::moderation::{
    DispatchSettings, ListingRepository, ModerationConfig, ModerationDispatcher,
    ModerationService,
};
use crate::infra::ai::{OpenRouterClient, OpenRouterConfig};
use crate::infra::moderation::{ImageSafetyClient, NewListing, SqliteListingStore};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

#[derive(Debug, Parser)]
#[command(name = "listing-moderator", about = "Automated moderation for rental listings")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a listing from a JSON file and queue it for moderation
    Submit { path: PathBuf },
    /// Queue existing listings for moderation
    Moderate {
        #[arg(required = true)]
        listing_ids: Vec<i64>,
    },
    /// Reset a listing to PENDING and moderate it again
    Rerun { listing_id: i64 },
    /// Queue every PENDING listing that was never moderated
    Sweep {
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Print the moderation state of a listing
    Status { listing_id: i64 },
}

/// Commands that queue moderation work.
enum Job {
    Submit(PathBuf),
    Moderate(Vec<i64>),
    Rerun(i64),
    Sweep(u32),
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn moderation_config() -> ModerationConfig {
    let defaults = ModerationConfig::default();
    ModerationConfig {
        image_confidence_threshold: env_parse("MODERATION_IMAGE_THRESHOLD")
            .unwrap_or(defaults.image_confidence_threshold),
        call_timeout: env_parse("MODERATION_CALL_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.call_timeout),
        max_attempts: env_parse("MODERATION_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
        initial_backoff: defaults.initial_backoff,
    }
}

fn dispatch_settings() -> DispatchSettings {
    let defaults = DispatchSettings::default();
    DispatchSettings {
        max_concurrent_jobs: env_parse("MODERATION_MAX_CONCURRENT_JOBS")
            .unwrap_or(defaults.max_concurrent_jobs),
        persist_attempts: env_parse("MODERATION_PERSIST_ATTEMPTS")
            .unwrap_or(defaults.persist_attempts),
        persist_backoff: defaults.persist_backoff,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt::init();

    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let database_path =
        std::env::var("DATABASE_PATH").unwrap_or_else(|_| "data/listings.db".to_string());

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // This is the "composition root" where we wire everything together.

    let store = SqliteListingStore::new(&database_path)
        .await
        .with_context(|| format!("Failed to open listing database at {}", database_path))?;

    // Read-only command, no classifiers needed
    let job = match cli.command {
        Command::Status { listing_id } => return print_status(&store, listing_id).await,
        Command::Submit { path } => Job::Submit(path),
        Command::Moderate { listing_ids } => Job::Moderate(listing_ids),
        Command::Rerun { listing_id } => Job::Rerun(listing_id),
        Command::Sweep { limit } => Job::Sweep(limit),
    };

    let config = moderation_config();

    let openrouter_api_key = std::env::var("OPENROUTER_API_KEY")
        .context("Missing OPENROUTER_API_KEY environment variable!")?;
    let mut openrouter_config = OpenRouterConfig::new(
        std::env::var("OPENROUTER_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
    );
    if let Ok(base_url) = std::env::var("OPENROUTER_BASE_URL") {
        openrouter_config.base_url = base_url;
    }
    let text_client = OpenRouterClient::new(openrouter_api_key, openrouter_config)?;

    let image_client = ImageSafetyClient::new(
        std::env::var("IMAGE_SAFETY_URL").context("Missing IMAGE_SAFETY_URL environment variable!")?,
        std::env::var("IMAGE_BUCKET").unwrap_or_else(|_| "listing-photos".to_string()),
        std::env::var("IMAGE_SAFETY_API_KEY").ok(),
        config.call_timeout,
    )?;

    let service = Arc::new(ModerationService::new(
        store,
        text_client,
        image_client,
        config,
    ));
    let dispatcher = ModerationDispatcher::spawn(Arc::clone(&service), dispatch_settings());

    // ========================================================================
    // COMMANDS
    // ========================================================================

    match job {
        Job::Submit(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let listing: NewListing = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid listing JSON in {}", path.display()))?;
            let listing_id = service.repository().create_listing(&listing).await?;
            println!("Created listing {}", listing_id);
            dispatcher.submit(listing_id)?;
        }
        Job::Moderate(listing_ids) => {
            for listing_id in listing_ids {
                dispatcher.submit(listing_id)?;
            }
        }
        Job::Rerun(listing_id) => {
            if !service.repository().reset_to_pending(listing_id).await? {
                bail!("Listing {} does not exist", listing_id);
            }
            dispatcher.submit(listing_id)?;
        }
        Job::Sweep(limit) => {
            let listing_ids = service.repository().list_unmoderated_ids(limit).await?;
            tracing::info!(count = listing_ids.len(), "Queueing unmoderated listings");
            for listing_id in listing_ids {
                dispatcher.submit(listing_id)?;
            }
        }
    }

    let summary = dispatcher.shutdown().await;
    println!(
        "Moderation finished: {} decided, {} skipped, {} failed",
        summary.decided, summary.skipped, summary.failed
    );

    if summary.failed > 0 {
        bail!("{} listing(s) could not be moderated", summary.failed);
    }
    Ok(())
}

async fn print_status(store: &SqliteListingStore, listing_id: i64) -> anyhow::Result<()> {
    let Some(listing) = store.get_listing_with_images_and_address(listing_id).await? else {
        bail!("Listing {} does not exist", listing_id);
    };

    println!("Listing {}: {}", listing.id, listing.title);
    println!("  status:    {}", listing.status);
    println!(
        "  moderated: {}",
        listing
            .moderated_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    if let Some(reason) = listing.moderation_reason {
        println!("  reason:    {}", reason);
    }
    Ok(())
}
