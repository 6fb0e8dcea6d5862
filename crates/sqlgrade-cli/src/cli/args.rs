use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "sqlgrade",
    version,
    about = "Grade SQL submissions against authored problems"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Execute a query against a problem's data without grading it
    Run(RunArgs),
    /// Grade a query and record the result
    Submit(SubmitArgs),
    /// Inspect remote Parquet datasets (schema, row count, sample)
    ValidateDataset(ValidateDatasetArgs),
    /// Check that problems can be graded end to end
    SelfCheck(SelfCheckArgs),
    /// Show submission counters
    Stats(StatsArgs),
    Init(InitArgs),
    Version,
}

/// Where problems, objects and the engine config live.
#[derive(clap::Args, Debug, Clone)]
pub struct EngineArgs {
    /// Engine config (YAML). Missing file means defaults.
    #[arg(long, default_value = "sqlgrade.yaml")]
    pub config: PathBuf,

    /// Directory holding one `<problem-id>.yaml` per problem
    #[arg(long, default_value = "problems")]
    pub problems: PathBuf,

    /// Local object root: `<root>/<bucket>/<key>`
    #[arg(long, default_value = "objects")]
    pub objects: PathBuf,

    /// S3-compatible endpoint; takes precedence over --objects
    #[arg(long, env = "SQLGRADE_OBJECT_ENDPOINT")]
    pub endpoint: Option<String>,

    #[arg(long, env = "SQLGRADE_OBJECT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Reject unknown keys in the engine config
    #[arg(long)]
    pub strict: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct QueryArgs {
    pub problem: String,

    /// Query text; read from --file or stdin when absent
    #[arg(long)]
    pub sql: Option<String>,

    #[arg(long, conflicts_with = "sql")]
    pub file: Option<PathBuf>,

    #[arg(long, default_value = "cli")]
    pub user: String,

    /// text|json
    #[arg(long, default_value = "text")]
    pub format: String,
}

#[derive(Parser, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub engine: EngineArgs,
    #[command(flatten)]
    pub query: QueryArgs,
}

#[derive(Parser, Clone)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub engine: EngineArgs,
    #[command(flatten)]
    pub query: QueryArgs,

    #[arg(long, default_value = ".sqlgrade/sqlgrade.db")]
    pub db: PathBuf,

    /// Idempotency key. Defaults to a digest of user, problem and query.
    #[arg(long)]
    pub submission_id: Option<String>,
}

#[derive(Parser, Clone)]
pub struct ValidateDatasetArgs {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// `bucket/key`, optionally suffixed with `@etag`
    #[arg(required = true)]
    pub refs: Vec<String>,

    #[arg(long, default_value = "text")]
    pub format: String,
}

#[derive(Parser, Clone)]
pub struct SelfCheckArgs {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// Problem ids; every problem in --problems when empty
    pub problem_ids: Vec<String>,

    #[arg(long, default_value = "text")]
    pub format: String,
}

#[derive(Parser, Clone)]
pub struct StatsArgs {
    #[arg(long, default_value = ".sqlgrade/sqlgrade.db")]
    pub db: PathBuf,

    #[arg(long, requires = "problem")]
    pub user: Option<String>,

    #[arg(long, requires = "user")]
    pub problem: Option<String>,
}

#[derive(Parser, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = "sqlgrade.yaml")]
    pub config: PathBuf,

    #[arg(long, default_value = "problems")]
    pub problems: PathBuf,

    #[arg(long)]
    pub gitignore: bool,
}
