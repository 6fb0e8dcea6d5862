use super::{build_grader, config_failure, exit_codes, parse_object_ref, render_cell};
use crate::cli::args::ValidateDatasetArgs;
use sqlgrade_core::validate::MultiTableReport;

pub async fn run(args: ValidateDatasetArgs) -> anyhow::Result<i32> {
    let refs = match args
        .refs
        .iter()
        .map(|r| parse_object_ref(r))
        .collect::<anyhow::Result<Vec<_>>>()
    {
        Ok(refs) => refs,
        Err(e) => return config_failure(&e).ok_or(e),
    };
    let grader = match build_grader(&args.engine, None) {
        Ok(g) => g,
        Err(e) => return config_failure(&e).ok_or(e),
    };

    let report = grader.validator().validate_many(&refs).await;
    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(if report.ok {
        exit_codes::OK
    } else {
        exit_codes::TEST_FAILED
    })
}

fn print_report(report: &MultiTableReport) {
    for t in &report.tables {
        let label = format!("{}/{}", t.bucket, t.key);
        match (&t.report, &t.error) {
            (Some(r), _) => {
                eprintln!(
                    "✔ {} (etag {}, {} rows in {} row groups, {} bytes read)",
                    label, r.etag, r.row_count, r.row_groups, r.bytes_read
                );
                for c in &r.schema {
                    eprintln!("    {} {}", c.name, c.ty.as_str());
                }
                if let Some(reason) = &r.sample_skipped {
                    eprintln!("    sample skipped: {}", reason);
                }
                for row in &r.sample_rows {
                    let cells: Vec<String> = row.iter().map(render_cell).collect();
                    eprintln!("    | {}", cells.join(" | "));
                }
            }
            (None, err) => {
                eprintln!("✖ {}: {}", label, err.as_deref().unwrap_or("unknown error"));
            }
        }
    }
}
