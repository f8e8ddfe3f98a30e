//! Release artifact storage server (stashd)

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod catalog;
mod config;
mod ingest;
mod releases;
mod store;

use config::Config;
use stash_core::pack::store::ChunkStore;
use stash_core::pack::PackOptions;
use stash_core::Hash32;

#[derive(Parser)]
#[command(name = "stashd")]
#[command(about = "Release artifact storage server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve,
    /// Summarize the data directory
    Status,
    /// Verify every chunk in a store directory
    VerifyStore {
        /// Store directory (e.g. ./data/stores/<uuid>)
        path: PathBuf,
    },
    /// Rebuild a store's index files from its packs
    RebuildIndex {
        path: PathBuf,
    },
    /// Repair a store's pack files, then rebuild its indexes
    RepairPacks {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stashd=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => run_server(config).await,
        Commands::Status => show_status(&config),
        Commands::VerifyStore { path } => verify_store(&config, &path),
        Commands::RebuildIndex { path } => rebuild_index(&config, &path),
        Commands::RepairPacks { path } => repair_packs(&config, &path),
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    let catalog = Arc::new(catalog::MemoryCatalog::new());
    let state = api::AppState::new(config.clone(), catalog)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.rest_port));
    tracing::info!(
        name = %config.server_name,
        data_dir = %config.data_dir,
        "starting stashd"
    );
    api::rest::serve(addr, state).await
}

fn pack_options(config: &Config) -> PackOptions {
    PackOptions {
        max_pack_size: config.max_pack_size,
        compression_level: config.compression_level,
    }
}

fn show_status(config: &Config) -> anyhow::Result<()> {
    let data_dir = PathBuf::from(&config.data_dir);
    println!("data dir: {}", data_dir.display());

    let releases_dir = data_dir.join("releases");
    let release_count = std::fs::read_dir(&releases_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rdef"))
                .count()
        })
        .unwrap_or(0);
    println!("releases: {release_count}");

    let stores_dir = data_dir.join("stores");
    match std::fs::read_dir(&stores_dir) {
        Ok(entries) => {
            for entry in entries.filter_map(|e| e.ok()) {
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let store = ChunkStore::open(entry.path(), pack_options(config))?;
                println!(
                    "store {}: {} chunks",
                    entry.file_name().to_string_lossy(),
                    store.chunk_count()
                );
            }
        }
        Err(_) => println!("stores: none"),
    }
    Ok(())
}

fn verify_store(config: &Config, path: &PathBuf) -> anyhow::Result<()> {
    let store = ChunkStore::open(path, pack_options(config))?;
    println!("verifying {} chunks in {}", store.chunk_count(), path.display());
    let corrupt = store.verify()?;
    if corrupt.is_empty() {
        println!("ok");
    } else {
        for hash in &corrupt {
            println!("corrupt: {hash}");
        }
        println!("{} corrupt chunks; run repair-packs", corrupt.len());
        std::process::exit(1);
    }
    Ok(())
}

fn rebuild_index(config: &Config, path: &PathBuf) -> anyhow::Result<()> {
    let store = ChunkStore::open(path, pack_options(config))?;
    let count = store.rebuild_indexes(Hash32::compute)?;
    println!("rebuilt indexes covering {count} chunks");
    Ok(())
}

fn repair_packs(config: &Config, path: &PathBuf) -> anyhow::Result<()> {
    let store = ChunkStore::open(path, pack_options(config))?;
    store.repair(Hash32::compute)?;
    println!("repair complete; {} chunks indexed", store.chunk_count());
    Ok(())
}
