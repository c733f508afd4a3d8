//! `conflux` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    — load integrations and start the HTTP server.
//! - `validate` — check a workflow or integration document.
//! - `run`      — execute an integration document once and print the result.
//! - `migrate`  — run pending database migrations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use bindings::{ApplicationDirectory, HttpRoutes};
use clap::{Parser, Subcommand};
use db::PoolSettings;
use engine::{
    EngineConfig, IntegrationDocument, IntegrationRegistry, MemoryKvStore, MemorySnapshotStore, PgSnapshotStore, Services,
    SnapshotStore, TokioScheduler,
};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use workflow::{Context, Graph};

#[derive(Parser)]
#[command(name = "conflux", about = "Workflow integration engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server.
    Serve {
        #[arg(long, env = "CONFLUX_BIND", default_value = "0.0.0.0:8080")]
        bind: String,
        /// Persist snapshots and integration documents in Postgres.
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        /// Directory of integration documents to install and start.
        #[arg(long, env = "CONFLUX_INTEGRATIONS")]
        integrations: Option<PathBuf>,
        /// Engine settings, as a JSON file.
        #[arg(long, env = "CONFLUX_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Check a workflow (a JSON array of steps) or an integration document.
    Validate {
        path: PathBuf,
    },
    /// Execute an integration document once, in memory.
    Run {
        path: PathBuf,
        /// Initial message, as JSON text.
        #[arg(long)]
        message: Option<String>,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            bind,
            database_url,
            integrations,
            config,
        } => {
            let config = match config {
                Some(path) => EngineConfig::from_file(&path)
                    .with_context(|| format!("invalid engine config {}", path.display()))?,
                None => EngineConfig::default(),
            };
            serve(&bind, database_url.as_deref(), integrations.as_deref(), config).await
        }
        Command::Validate { path } => validate(&path),
        Command::Run { path, message } => run(&path, message.as_deref()).await,
        Command::Migrate { database_url } => {
            db::pool::connect(&database_url, &PoolSettings::migrations_only())
                .await
                .context("migration failed")?;
            info!("migrations applied");
            Ok(())
        }
    }
}

async fn serve(bind: &str, database_url: Option<&str>, dir: Option<&Path>, config: EngineConfig) -> Result<()> {
    let ctx = Context::new();
    let pool = match database_url {
        Some(url) => Some(
            db::pool::connect(url, &config.database)
                .await
                .context("failed to connect to database")?,
        ),
        None => None,
    };

    let integrations = IntegrationRegistry::new();
    let applications = ApplicationDirectory::new();
    let routes = HttpRoutes::new();

    let snapshots: Arc<dyn SnapshotStore> = match &pool {
        Some(pool) => Arc::new(PgSnapshotStore::new(pool.clone())),
        None => Arc::new(MemorySnapshotStore::new()),
    };
    let scheduler = TokioScheduler::new().with_lock_store(Arc::new(MemoryKvStore::new()));
    let services = Services::new()
        .with_config(config)
        .with_endpoints(Arc::new(applications.clone()))
        .with_scheduler(Arc::new(scheduler))
        .with_snapshots(snapshots);

    let mut documents = Vec::new();
    if let Some(dir) = dir {
        documents.extend(read_documents(dir)?);
    }
    if let Some(pool) = &pool {
        for row in db::repository::integrations::list_integrations(pool).await? {
            match row.decode::<IntegrationDocument>() {
                Ok(doc) => documents.push(doc),
                Err(e) => warn!(error = %e, "skipping stored integration"),
            }
        }
    }

    for doc in &documents {
        let installed = integrations
            .install(doc, services.clone(), &ctx)
            .and_then(|it| it.start(&ctx));
        match installed {
            Ok(()) => info!(integration_id = %doc.id, "integration started"),
            Err(e) => warn!(integration_id = %doc.id, error = %e, "failed to start integration"),
        }
    }

    let mut state = api::AppState::new(integrations.clone(), applications, routes, services);
    if let Some(pool) = pool {
        state = state.with_pool(pool);
    }

    info!(bind, integrations = integrations.len(), "starting server");
    api::serve(bind, state).await.context("server failed")?;

    integrations.stop_all(&ctx);
    Ok(())
}

/// Every `*.json` file of `dir`, in name order.
fn read_documents(dir: &Path) -> Result<Vec<IntegrationDocument>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    paths
        .iter()
        .map(|path| {
            IntegrationDocument::from_file(path).with_context(|| format!("invalid integration {}", path.display()))
        })
        .collect()
}

fn validate(path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let doc: Value = serde_json::from_str(&text).context("invalid JSON")?;

    let graph = match doc {
        Value::Array(_) => Graph::from_value(&doc)?,
        _ => {
            let doc: IntegrationDocument = serde_json::from_value(doc).context("invalid integration document")?;
            let definition = doc.definition()?;
            definition.graph().as_ref().clone()
        }
    };

    let dangling = graph.unresolved_edges();
    for (step, from) in &dangling {
        warn!(step, from, "step follows an unknown step");
    }
    if graph.is_empty() {
        bail!("workflow has no steps");
    }

    let first = graph.first_step().map(|s| s.id.as_str()).unwrap_or("-");
    println!("valid: {} steps, first step '{first}'", graph.len());
    for step in graph.steps() {
        println!("  {:<12} {}", step.id, step.type_name());
    }
    Ok(())
}

async fn run(path: &Path, message: Option<&str>) -> Result<()> {
    let doc = IntegrationDocument::from_file(path).with_context(|| format!("invalid integration {}", path.display()))?;
    let message = message
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("message is not valid JSON")?;

    let ctx = Context::new();
    let registry = IntegrationRegistry::new();
    let it = registry.install(&doc, Services::new(), &ctx)?;
    it.start(&ctx)?;

    let trx = it.execute(message, ctx).await?;
    println!("{}", serde_json::to_string_pretty(&trx.snapshot())?);
    if trx.is_failed() {
        bail!("transaction {} failed", trx.id());
    }
    Ok(())
}
