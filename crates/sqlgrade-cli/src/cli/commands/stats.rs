use super::exit_codes;
use crate::cli::args::StatsArgs;
use sqlgrade_core::storage::{Store, SubmissionStore};

pub fn run(args: StatsArgs) -> anyhow::Result<i32> {
    if !args.db.exists() {
        eprintln!("no submission database at {}", args.db.display());
        return Ok(exit_codes::CONFIG_ERROR);
    }
    let store = Store::open(&args.db)?;
    store.init_schema()?;

    let out = match (&args.user, &args.problem) {
        (Some(user), Some(problem)) => match store.attempt_stats(user, problem)? {
            Some(stats) => serde_json::to_value(stats)?,
            None => serde_json::json!({
                "user_id": user,
                "problem_id": problem,
                "attempts": 0,
                "correct": 0,
            }),
        },
        _ => serde_json::to_value(store.stats_best_effort()?)?,
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(exit_codes::OK)
}
