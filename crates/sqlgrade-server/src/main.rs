use anyhow::{Context, Result};
use clap::Parser;
use sqlgrade_core::catalog::{DirectoryCatalog, ProblemCatalog};
use sqlgrade_core::config::EngineConfig;
use sqlgrade_core::storage::{HttpObjectStore, LocalObjectStore, ObjectStore, Store, SubmissionStore};
use sqlgrade_core::Grader;
use sqlgrade_server::config;
use sqlgrade_server::server::Server;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "problems")]
    problems: PathBuf,

    /// Local object root: `<root>/<bucket>/<key>`
    #[arg(long, default_value = "objects")]
    objects: PathBuf,

    /// S3-compatible endpoint; takes precedence over --objects
    #[arg(long, env = "SQLGRADE_OBJECT_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long, env = "SQLGRADE_OBJECT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, default_value = ".sqlgrade/sqlgrade.db")]
    db: PathBuf,

    /// Engine config (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    strict: bool,
}

use tracing_subscriber::{fmt, EnvFilter};

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_grader(args: &Args) -> Result<Grader> {
    let mut engine = match &args.config {
        Some(path) => sqlgrade_core::config::load_engine_config(path, args.strict)
            .map_err(|e| anyhow::anyhow!("config error: {}", e))?,
        None => EngineConfig::default(),
    };
    engine.apply_env(|k| std::env::var(k).ok());

    let objects: Arc<dyn ObjectStore> = match &args.endpoint {
        Some(endpoint) => Arc::new(HttpObjectStore::new(endpoint, args.token.clone())?),
        None => Arc::new(LocalObjectStore::new(&args.objects)),
    };

    if let Some(parent) = args.db.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = Store::open(&args.db)?;
    store.init_schema()?;

    let catalog: Arc<dyn ProblemCatalog> = Arc::new(DirectoryCatalog::new(&args.problems));
    let store: Arc<dyn SubmissionStore> = Arc::new(store);
    Ok(Grader::new(engine, catalog, objects, store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    // Logging is configured from the environment, so read it before anything logs.
    let cfg = config::ServerConfig::from_env();

    init_logging(&cfg.log_level);

    let grader = Arc::new(build_grader(&args)?);
    tracing::info!(
        event = "server_start",
        problems = ?args.problems,
        db = ?args.db,
        config = ?cfg
    );

    Server::run(grader, cfg).await
}
