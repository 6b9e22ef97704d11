use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cashews_storage::{CacheStore, HttpFetcher, JsonSource, MIGRATIONS};
use cashews_sync::{SyncConfig, WorkerContext};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cashews")]
#[command(about = "MMOLB polling cache")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled poller until interrupted.
    Run {
        /// Run a single poller, without pre-sleep.
        #[arg(long)]
        only: Option<String>,
    },
    Migrate,
    League,
    Election,
    Players,
    RefreshPlayers,
    Games {
        #[arg(long)]
        new_only: bool,
    },
    Unfinished,
    /// Fetch every game id found in a text file.
    Backfill { file: PathBuf },
    BackfillPlayers,
    RebuildGames,
    /// Print the current payload of an entity.
    Show { kind: String, id: String },
    /// Print projected stat lines for a player.
    Stats { player_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { only: None }) {
        Commands::Run { only } => {
            cashews_sync::run_pollers(&config, only.as_deref()).await?;
        }
        Commands::Migrate => {
            let store = CacheStore::open_unmigrated(&config.database_path).await?;
            let before = store.schema_version().await?;
            let after = store.apply_migrations(MIGRATIONS).await?;
            println!("migrated {}: version {before} -> {after}", config.database_path.display());
        }
        Commands::League => cashews_sync::fetch_league(&worker(&config, "cli.league").await?).await?,
        Commands::Election => {
            cashews_sync::fetch_election(&worker(&config, "cli.election").await?).await?
        }
        Commands::Players => {
            cashews_sync::fetch_players(&worker(&config, "cli.players").await?).await?
        }
        Commands::RefreshPlayers => {
            cashews_sync::refresh_known_players(&worker(&config, "cli.refresh_players").await?)
                .await?
        }
        Commands::Games { new_only } => {
            cashews_sync::fetch_games(&worker(&config, "cli.games").await?, new_only).await?
        }
        Commands::Unfinished => {
            cashews_sync::refetch_unfinished_games(&worker(&config, "cli.unfinished").await?)
                .await?
        }
        Commands::Backfill { file } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let ctx = worker(&config, "cli.backfill").await?;
            let summary = cashews_sync::backfill_game_ids(&ctx, &text).await?;
            println!("backfill complete: found={} missing={}", summary.found, summary.missing);
        }
        Commands::BackfillPlayers => {
            let ctx = worker(&config, "cli.backfill_players").await?;
            let summary = cashews_sync::backfill_player_data(&ctx).await?;
            println!(
                "player stats rebuilt: projected={} failed={}",
                summary.projected, summary.failed
            );
        }
        Commands::RebuildGames => {
            let ctx = worker(&config, "cli.rebuild_games").await?;
            let summary = cashews_sync::rebuild_games(&ctx).await?;
            println!("games rebuilt: projected={} failed={}", summary.projected, summary.failed);
        }
        Commands::Show { kind, id } => {
            let store = CacheStore::open(&config.database_path).await?;
            match store.get_object(&kind, &id).await? {
                Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
                None => eprintln!("no current {kind}/{id}"),
            }
        }
        Commands::Stats { player_id } => {
            let store = CacheStore::open(&config.database_path).await?;
            let lines = cashews_projections::player_stats(&store, &player_id).await?;
            println!("{}", serde_json::to_string_pretty(&lines)?);
        }
    }

    Ok(())
}

async fn worker(config: &SyncConfig, name: &str) -> Result<WorkerContext> {
    let store = CacheStore::open(&config.database_path)
        .await
        .with_context(|| format!("opening store {}", config.database_path.display()))?;
    let source: Arc<dyn JsonSource> = Arc::new(HttpFetcher::new(config.http_client_config())?);
    Ok(WorkerContext::from_config(name, store, source, config))
}
