//! Release artifact storage client (stash)

use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

mod api;
mod config;
mod ingest;

use api::ApiClient;
use config::Config;
use stash_core::cancel::CancelToken;
use stash_core::chunker::recommend::{recommend, ChunkerPolicy};
use stash_core::chunker::ChunkerOptions;
use stash_core::package::codec::decode_package;

#[derive(Parser)]
#[command(name = "stash")]
#[command(about = "Release artifact storage client", long_about = None)]
struct Cli {
    /// Server base URL (overrides config)
    #[arg(long, global = true)]
    server: Option<String>,
    /// API key (overrides config)
    #[arg(long, global = true)]
    api_key: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save server URL and API key to the config file
    Configure {
        #[arg(long)]
        server: String,
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Show server name and version
    Info,
    /// Repository management
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
    /// List releases in a repository
    Releases {
        /// Repository name or id
        repo: String,
    },
    /// Ingest a directory tree as a new release
    Ingest {
        /// Release directory
        path: PathBuf,
        /// Repository name or id
        #[arg(long)]
        repo: String,
        /// Release version string
        #[arg(long)]
        version: String,
        /// Component name for the ingested tree
        #[arg(long, default_value = "main")]
        component: String,
        /// Release notes
        #[arg(long)]
        notes: Option<String>,
        /// Custom properties as key=value, repeatable
        #[arg(long = "property", value_name = "KEY=VALUE")]
        properties: Vec<String>,
        /// Chunker minimum size in bytes
        #[arg(long, default_value_t = 16 * 1024)]
        min_size: u32,
        /// Chunker average size in bytes (power of two)
        #[arg(long, default_value_t = 64 * 1024)]
        avg_size: u32,
        /// Chunker maximum size in bytes
        #[arg(long, default_value_t = 256 * 1024)]
        max_size: u32,
    },
    /// Download a release as tar.zst
    Download {
        /// Release id
        release: String,
        /// Output file (defaults to <release>.tar.zst)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Restrict to one component
        #[arg(long)]
        component: Option<String>,
        /// Old release id; produces a delta archive
        #[arg(long)]
        diff: Option<String>,
    },
    /// Sweep chunker parameters over a directory
    Recommend {
        path: PathBuf,
        #[arg(long, default_value = "balanced")]
        policy: String,
    },
    /// Print a summary of a release definition file
    Inspect {
        /// Path to a .rdef file
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum RepoCommands {
    /// Create a repository
    Create {
        name: String,
        #[arg(long, default_value = "standard")]
        storage_class: String,
    },
    /// List repositories
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stash=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    if let Commands::Configure { server, api_key } = &cli.command {
        let updated = Config {
            server_url: Some(server.clone()),
            api_key: api_key.clone(),
        };
        updated.save()?;
        println!("configuration written to {}", Config::config_path()?.display());
        return Ok(());
    }

    // Local-only commands need no client.
    match &cli.command {
        Commands::Recommend { path, policy } => return run_recommend(path, policy),
        Commands::Inspect { path } => return run_inspect(path),
        _ => {}
    }

    let server_url = config.server_url(cli.server.as_deref())?;
    let client = ApiClient::new(&server_url, config.api_key(cli.api_key.as_deref()));

    match cli.command {
        Commands::Configure { .. } | Commands::Recommend { .. } | Commands::Inspect { .. } => {
            unreachable!()
        }
        Commands::Info => {
            let info = client.server_info().await?;
            println!("{} {}", info.name, info.version);
        }
        Commands::Repo { command } => match command {
            RepoCommands::Create { name, storage_class } => {
                let repo = client.create_repo(&name, &storage_class).await?;
                println!("created repository {} ({})", repo.name, repo.id);
            }
            RepoCommands::List => {
                for repo in client.list_repos().await? {
                    println!("{}  {}  [{}]", repo.id, repo.name, repo.storage_class);
                }
            }
        },
        Commands::Releases { repo } => {
            let repo_id = resolve_repo(&client, &repo).await?;
            for release in client.list_releases(repo_id).await? {
                println!("{}  {}  {}", release.id, release.version, release.created_at);
            }
        }
        Commands::Ingest {
            path,
            repo,
            version,
            component,
            notes,
            properties,
            min_size,
            avg_size,
            max_size,
        } => {
            let repo_id = resolve_repo(&client, &repo).await?;
            let chunker = ChunkerOptions::new(min_size, avg_size, max_size)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let properties = parse_properties(&properties)?;
            ingest::run(
                &client,
                ingest::IngestOptions {
                    root: path,
                    repo_id,
                    version,
                    component,
                    notes,
                    properties,
                    chunker,
                },
            )
            .await?;
        }
        Commands::Download {
            release,
            output,
            component,
            diff,
        } => {
            let bytes = client
                .download_release(&release, component.as_deref(), diff.as_deref())
                .await?;
            let output = output.unwrap_or_else(|| PathBuf::from(format!("{release}.tar.zst")));
            std::fs::write(&output, &bytes)?;
            println!("wrote {} ({} bytes)", output.display(), bytes.len());
        }
    }
    Ok(())
}

/// Accept a repository id or name.
async fn resolve_repo(client: &ApiClient, repo: &str) -> anyhow::Result<Uuid> {
    if let Ok(id) = repo.parse::<Uuid>() {
        return Ok(id);
    }
    client
        .list_repos()
        .await?
        .into_iter()
        .find(|r| r.name == repo)
        .map(|r| r.id)
        .ok_or_else(|| anyhow::anyhow!("no repository named '{repo}'"))
}

fn parse_properties(pairs: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("property '{pair}' is not KEY=VALUE"))
        })
        .collect()
}

fn run_recommend(path: &PathBuf, policy: &str) -> anyhow::Result<()> {
    let policy = match policy {
        "balanced" => ChunkerPolicy::Balanced,
        "dedupe" => ChunkerPolicy::Dedupe,
        "throughput" => ChunkerPolicy::Throughput,
        "chunk-count" => ChunkerPolicy::ChunkCount,
        other => anyhow::bail!("unknown policy '{other}'"),
    };
    let rec = recommend(path, policy, &CancelToken::new()).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!(
        "recommended: min={} avg={} max={}",
        rec.best.options.min_size, rec.best.options.avg_size, rec.best.options.max_size
    );
    println!(
        "observed: {} chunks ({} unique), mean {:.0} bytes, stddev {:.0}, dedupe ratio {:.2}",
        rec.best.total_chunks,
        rec.best.unique_chunks,
        rec.best.observed_avg,
        rec.best.stddev,
        rec.best.dedupe_ratio()
    );
    for candidate in &rec.candidates {
        println!(
            "  avg {:>7}: {:>6} chunks, mean {:>7.0}, ratio {:.2}",
            candidate.options.avg_size,
            candidate.total_chunks,
            candidate.observed_avg,
            candidate.dedupe_ratio()
        );
    }
    Ok(())
}

fn run_inspect(path: &PathBuf) -> anyhow::Result<()> {
    let bytes = std::fs::read(path)?;
    let pkg = decode_package(&bytes).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("release {} (version {})", pkg.meta.release_id, pkg.meta.version);
    println!("repository: {}", pkg.meta.repo_id);
    if let Some(created) = pkg.meta.created_at_utc() {
        println!("created: {created}");
    }
    if let Some(notes) = &pkg.meta.notes {
        println!("notes: {notes}");
    }
    for (key, value) in &pkg.meta.custom_properties {
        println!("property {key} = {value}");
    }
    println!(
        "{} components, {} files, {} chunks, {} raw bytes ({} deduped)",
        pkg.stats.component_count,
        pkg.stats.file_count,
        pkg.stats.chunk_count,
        pkg.stats.raw_size,
        pkg.stats.deduped_size
    );
    for component in &pkg.components {
        println!("  [{}] {} files", component.name, component.files.len());
        for file in &component.files {
            let size = pkg.file_size(file).map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("    {}  {}  {} bytes", file.name, file.file_hash, size);
        }
    }
    Ok(())
}
