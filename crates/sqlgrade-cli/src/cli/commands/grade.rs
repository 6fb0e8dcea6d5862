use super::{build_grader, config_failure, exit_codes, print_table, read_sql};
use crate::cli::args::{RunArgs, SubmitArgs};
use sqlgrade_core::errors::GradeError;
use sqlgrade_core::fingerprint::sha256_hex;
use sqlgrade_core::model::{Caller, GradingOutcome};

pub async fn cmd_run(args: RunArgs) -> anyhow::Result<i32> {
    let grader = match build_grader(&args.engine, None) {
        Ok(g) => g,
        Err(e) => return config_failure(&e).ok_or(e),
    };
    let sql = read_sql(&args.query).await?;
    let caller = Caller::new(&args.query.user);

    let out = match grader.run_test(&caller, &args.query.problem, &sql).await {
        Ok(out) => out,
        Err(e) => return Ok(report_grade_error(&e)),
    };

    if args.query.format == "json" {
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if let Some(err) = &out.error {
        eprintln!("error ({:?}): {}", err.kind, err.message);
    } else {
        print_table(&out.columns, &out.rows);
        if out.truncated {
            eprintln!("(output truncated)");
        }
        eprintln!("{} ms", out.execution_time_ms);
    }

    Ok(if out.error.is_some() {
        exit_codes::TEST_FAILED
    } else {
        exit_codes::OK
    })
}

pub async fn cmd_submit(args: SubmitArgs) -> anyhow::Result<i32> {
    let grader = match build_grader(&args.engine, Some(&args.db)) {
        Ok(g) => g,
        Err(e) => return config_failure(&e).ok_or(e),
    };
    let sql = read_sql(&args.query).await?;
    let caller = Caller::new(&args.query.user);
    let submission_id = args.submission_id.clone().unwrap_or_else(|| {
        let digest = sha256_hex(&format!("{}\n{}\n{}", args.query.user, args.query.problem, sql));
        format!("cli-{}", &digest[..16])
    });

    let res = match grader
        .submit(&caller, &args.query.problem, &sql, &submission_id)
        .await
    {
        Ok(res) => res,
        Err(e) => return Ok(report_grade_error(&e)),
    };

    if args.query.format == "json" {
        println!("{}", serde_json::to_string_pretty(&res)?);
    } else {
        println!("{}: {}", submission_id, res.outcome.as_str());
        if let Some(kind) = res.error_kind {
            println!("kind: {:?}", kind);
        }
        if let Some(msg) = &res.diagnostic_message {
            println!("{}", msg);
        }
    }

    Ok(if res.outcome == GradingOutcome::Correct {
        exit_codes::OK
    } else {
        exit_codes::TEST_FAILED
    })
}

fn report_grade_error(e: &GradeError) -> i32 {
    eprintln!("{}: {}", e.code(), e);
    match e {
        GradeError::ProblemNotFound(_) | GradeError::InvalidProblem(_) | GradeError::Other(_) => {
            exit_codes::CONFIG_ERROR
        }
        _ => exit_codes::TEST_FAILED,
    }
}
