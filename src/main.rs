use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use tripvector::config::{AppConfig, ProviderKind};
use tripvector::dataset::{Dataset, EntityKind};
use tripvector::embedding::{EmbeddingClient, EmbeddingProvider, LocalEmbedder, OpenAiEmbedder};
use tripvector::sync::{CheckpointStore, Snapshot, SyncEngine};
use tripvector::vector::{IndexBackend, LanceIndex, MemoryIndex, QueryGateway, VectorIndex};

#[derive(Parser)]
#[command(
    name = "tripvector",
    version,
    about = "Incremental embedding sync for travel entities"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to <config dir>/tripvector/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Embed new entities and push pending ones to the index.
    Sync {
        /// JSON Lines dataset, one entity per line.
        #[arg(long)]
        input: PathBuf,
    },
    /// Nearest entities of one kind to a free-text query.
    Query {
        text: String,
        #[arg(long)]
        kind: EntityKind,
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Snapshot and checkpoint state.
    Status,
    /// Delete the checkpoint so the next run starts from scratch.
    ResetCheckpoint,
    /// Print the effective configuration as TOML.
    Config,
}

fn init_logging(debug: bool) {
    let default = if debug { "tripvector=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(debug).with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Sync { input } => sync(&config, &input).await,
        Command::Query { text, kind, top_k } => {
            query(&config, &text, kind, top_k.unwrap_or(config.query.default_top_k)).await
        }
        Command::Status => status(&config).await,
        Command::ResetCheckpoint => {
            let store = CheckpointStore::new(&config.checkpoint.path);
            store.clear()?;
            tracing::info!(path = %store.path().display(), "checkpoint removed");
            Ok(())
        }
        Command::Config => {
            let mut shown = config.clone();
            if shown.embedding.api_key.is_some() {
                shown.embedding.api_key = Some("<redacted>".to_string());
            }
            print!("{}", toml::to_string_pretty(&shown)?);
            Ok(())
        }
    }
}

async fn sync(config: &AppConfig, input: &std::path::Path) -> anyhow::Result<()> {
    let dataset = Dataset::load_jsonl(input)?;
    tracing::info!(entities = dataset.len(), path = %input.display(), "dataset loaded");

    let engine = SyncEngine::new(
        build_embedder(config)?,
        build_index(config).await?,
        Snapshot::open(&config.snapshot.path).await?,
        CheckpointStore::new(&config.checkpoint.path),
        config.sync_options(),
    );

    tokio::select! {
        summary = engine.run(&dataset) => {
            let summary = summary?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, progress is kept in the checkpoint");
            Ok(())
        }
    }
}

async fn query(
    config: &AppConfig,
    text: &str,
    kind: EntityKind,
    top_k: usize,
) -> anyhow::Result<()> {
    let gateway = QueryGateway::new(
        build_index(config).await?,
        build_embedder(config)?,
        config.index.max_results,
        config.index_retry(),
        config.request_timeout(),
    );
    let matches = gateway.query(text, top_k, kind).await?;

    let hits: Vec<serde_json::Value> = matches
        .into_iter()
        .map(|hit| {
            serde_json::json!({
                "id": hit.id,
                "score": hit.score,
                "metadata": hit.metadata,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&hits)?);
    Ok(())
}

async fn status(config: &AppConfig) -> anyhow::Result<()> {
    let snapshot = Snapshot::open(&config.snapshot.path).await?;
    let counts = snapshot.counts().await?;
    let checkpoint = CheckpointStore::new(&config.checkpoint.path).load()?;

    let report = serde_json::json!({
        "snapshot": {
            "path": config.snapshot.path,
            "total": counts.total,
            "unsynced": counts.unsynced,
        },
        "checkpoint": checkpoint.map(|checkpoint| serde_json::json!({
            "path": config.checkpoint.path,
            "embeddings": checkpoint.embeddings.len(),
            "last_processed_index": checkpoint.last_processed_index,
        })),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn build_embedder(config: &AppConfig) -> anyhow::Result<EmbeddingClient> {
    let provider: Arc<dyn EmbeddingProvider> = match config.embedding.provider {
        ProviderKind::OpenAi => {
            let api_key = config
                .api_key()
                .context("no embedding API key: set embedding.api_key or OPENAI_API_KEY")?;
            let dimensions = config
                .embedding
                .request_dimensions
                .then_some(config.index.embedding_dim);
            Arc::new(OpenAiEmbedder::new(
                &api_key,
                &config.embedding.base_url,
                &config.embedding.model,
                dimensions,
                config.embedding_timeout(),
            )?)
        }
        ProviderKind::Local => {
            let cache_dir = config
                .embedding
                .cache_dir
                .clone()
                .or_else(|| dirs::cache_dir().map(|dir| dir.join("tripvector")))
                .unwrap_or_else(|| PathBuf::from(".fastembed_cache"));
            Arc::new(LocalEmbedder::new(&cache_dir)?)
        }
    };

    tracing::debug!(model = provider.model_name(), "embedding provider ready");
    Ok(EmbeddingClient::new(
        provider,
        config.index.embedding_dim,
        config.embedding.max_input_chars,
        config.embedding_timeout(),
        config.embedding_retry(),
    ))
}

async fn build_index(config: &AppConfig) -> anyhow::Result<Arc<dyn VectorIndex>> {
    Ok(match config.index.backend {
        IndexBackend::LanceDb => Arc::new(
            LanceIndex::connect(
                &config.index.uri,
                &config.index.table_name,
                config.index.embedding_dim,
            )
            .await?,
        ),
        IndexBackend::Memory => {
            tracing::warn!("using the in-memory index, nothing is persisted remotely");
            Arc::new(MemoryIndex::new())
        }
    })
}
