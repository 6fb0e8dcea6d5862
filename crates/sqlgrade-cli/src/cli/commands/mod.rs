use super::args::*;
use anyhow::Context;
use sqlgrade_core::catalog::{DirectoryCatalog, ProblemCatalog};
use sqlgrade_core::config::EngineConfig;
use sqlgrade_core::model::{ObjectRef, Value};
use sqlgrade_core::storage::{HttpObjectStore, LocalObjectStore, ObjectStore, Store, SubmissionStore};
use sqlgrade_core::Grader;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

pub mod self_check;
pub mod grade;
pub mod stats;
pub mod validate;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const TEST_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Init(args) => cmd_init(args).await,
        Command::Run(args) => grade::cmd_run(args).await,
        Command::Submit(args) => grade::cmd_submit(args).await,
        Command::ValidateDataset(args) => validate::run(args).await,
        Command::SelfCheck(args) => self_check::run(args).await,
        Command::Stats(args) => stats::run(args),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(exit_codes::OK)
        }
    }
}

async fn cmd_init(args: InitArgs) -> anyhow::Result<i32> {
    if args.config.exists() {
        eprintln!("note: {} already exists", args.config.display());
    } else {
        ensure_parent_dir(&args.config)?;
        sqlgrade_core::config::write_sample_config(&args.config)?;
        eprintln!("created {}", args.config.display());
    }

    std::fs::create_dir_all(&args.problems)?;
    let problem = args.problems.join("sum-orders.yaml");
    if problem.exists() {
        eprintln!("note: {} already exists", problem.display());
    } else {
        sqlgrade_core::config::problem::write_sample_problem(&problem)?;
        eprintln!("created {}", problem.display());
    }
    write_file_if_missing(
        &args.problems.join("sum-orders.sql"),
        crate::templates::SAMPLE_QUERY,
    )?;

    if args.gitignore {
        write_file_if_missing(Path::new(".gitignore"), crate::templates::GITIGNORE)?;
    }
    Ok(exit_codes::OK)
}

fn write_file_if_missing(path: &Path, content: &str) -> anyhow::Result<()> {
    ensure_parent_dir(path)?;
    if !path.exists() {
        std::fs::write(path, content)?;
        eprintln!("created {}", path.display());
    } else {
        eprintln!("note: {} already exists (skipped)", path.display());
    }
    Ok(())
}

pub(crate) fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Engine config from `--config` (defaults when the file is absent) plus `SQLGRADE_*` overrides.
pub(crate) fn load_engine_config(args: &EngineArgs) -> anyhow::Result<EngineConfig> {
    let mut cfg = if args.config.exists() {
        sqlgrade_core::config::load_engine_config(&args.config, args.strict)
            .map_err(|e| anyhow::anyhow!("config error: {}", e))?
    } else {
        EngineConfig::default()
    };
    cfg.apply_env(|k| std::env::var(k).ok());
    Ok(cfg)
}

pub(crate) fn object_store(args: &EngineArgs) -> anyhow::Result<Arc<dyn ObjectStore>> {
    Ok(match &args.endpoint {
        Some(endpoint) => Arc::new(
            HttpObjectStore::new(endpoint, args.token.clone())
                .map_err(|e| anyhow::anyhow!("config error: {}", e))?,
        ),
        None => Arc::new(LocalObjectStore::new(&args.objects)),
    })
}

/// Builds a grader; `db` selects a persistent submission store, otherwise an in-memory one.
pub(crate) fn build_grader(args: &EngineArgs, db: Option<&Path>) -> anyhow::Result<Grader> {
    let cfg = load_engine_config(args)?;
    let store = match db {
        Some(path) => {
            ensure_parent_dir(path)?;
            Store::open(path)?
        }
        None => Store::memory()?,
    };
    store.init_schema()?;
    let catalog: Arc<dyn ProblemCatalog> = Arc::new(DirectoryCatalog::new(&args.problems));
    let store: Arc<dyn SubmissionStore> = Arc::new(store);
    Ok(Grader::new(cfg, catalog, object_store(args)?, store))
}

/// Maps errors raised while building the engine to the config exit code.
pub(crate) fn config_failure(e: &anyhow::Error) -> Option<i32> {
    if e.to_string().contains("config error") {
        eprintln!("{e}");
        return Some(exit_codes::CONFIG_ERROR);
    }
    None
}

pub(crate) async fn read_sql(q: &QueryArgs) -> anyhow::Result<String> {
    if let Some(sql) = &q.sql {
        return Ok(sql.clone());
    }
    if let Some(path) = &q.file {
        return tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()));
    }
    let mut buf = String::new();
    tokio::io::stdin().read_to_string(&mut buf).await?;
    Ok(buf)
}

/// Parses `bucket/key[@etag]`.
pub(crate) fn parse_object_ref(raw: &str) -> anyhow::Result<ObjectRef> {
    let (path, etag) = match raw.rsplit_once('@') {
        Some((p, e)) if !e.is_empty() => (p, Some(e)),
        _ => (raw, None),
    };
    let Some((bucket, key)) = path.split_once('/') else {
        anyhow::bail!("config error: object reference '{raw}' must look like bucket/key");
    };
    if bucket.is_empty() || key.is_empty() {
        anyhow::bail!("config error: object reference '{raw}' must look like bucket/key");
    }
    let r = ObjectRef::new(bucket, key);
    Ok(match etag {
        Some(e) => r.with_etag(e),
        None => r,
    })
}

pub(crate) fn render_cell(v: &Value) -> String {
    match v {
        Value::Null => "NULL".into(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => s.clone(),
    }
}

pub(crate) fn print_table(columns: &[String], rows: &[Vec<Value>]) {
    println!("{}", columns.join("\t"));
    for row in rows {
        let cells: Vec<String> = row.iter().map(render_cell).collect();
        println!("{}", cells.join("\t"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_ref() {
        let r = parse_object_ref("datasets/shop/orders.parquet").unwrap();
        assert_eq!(r.bucket, "datasets");
        assert_eq!(r.key, "shop/orders.parquet");
        assert!(r.etag.is_none());

        let r = parse_object_ref("datasets/orders.parquet@abc123").unwrap();
        assert_eq!(r.key, "orders.parquet");
        assert_eq!(r.etag.as_deref(), Some("abc123"));

        assert!(parse_object_ref("no-key").is_err());
        assert!(parse_object_ref("/key").is_err());
    }
}
