use super::{build_grader, config_failure, exit_codes};
use crate::cli::args::SelfCheckArgs;
use sqlgrade_core::validate::SelfCheckReport;

pub async fn run(args: SelfCheckArgs) -> anyhow::Result<i32> {
    let grader = match build_grader(&args.engine, None) {
        Ok(g) => g,
        Err(e) => return config_failure(&e).ok_or(e),
    };

    let ids = if args.problem_ids.is_empty() {
        problem_ids_in(&args.engine.problems)?
    } else {
        args.problem_ids.clone()
    };
    if ids.is_empty() {
        eprintln!("no problems found in {}", args.engine.problems.display());
        return Ok(exit_codes::CONFIG_ERROR);
    }

    let mut reports = Vec::with_capacity(ids.len());
    let mut failed = false;
    for id in &ids {
        match grader.self_check(id).await {
            Ok(report) => {
                failed |= !report.ok;
                reports.push(report);
            }
            Err(e) => {
                eprintln!("{}: {}: {}", id, e.code(), e);
                failed = true;
            }
        }
    }

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for r in &reports {
            print_report(r);
        }
    }

    Ok(if failed {
        exit_codes::TEST_FAILED
    } else {
        exit_codes::OK
    })
}

fn problem_ids_in(dir: &std::path::Path) -> anyhow::Result<Vec<String>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if let (true, Some(stem)) = (is_yaml, path.file_stem().and_then(|s| s.to_str())) {
            ids.push(stem.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

fn print_report(r: &SelfCheckReport) {
    let mark = if r.ok { "✔" } else { "✖" };
    eprintln!("{} {}", mark, r.problem_id);
    for c in &r.checks {
        let mark = if c.ok { "ok" } else { "FAIL" };
        match &c.detail {
            Some(d) => eprintln!("    {:<4} {}: {}", mark, c.name, d),
            None => eprintln!("    {:<4} {}", mark, c.name),
        }
    }
}
