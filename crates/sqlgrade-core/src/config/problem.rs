use crate::errors::ConfigError;
use crate::model::{ExpectedOutput, ProblemSpec, TableSource};
use std::collections::HashSet;
use std::path::Path;

/// Loads and validates one problem definition file.
pub fn load_problem(path: &Path, strict: bool) -> Result<ProblemSpec, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read problem {}: {}", path.display(), e)))?;
    parse_problem(&raw, strict).map_err(|e| ConfigError(format!("{} (file: {})", e, path.display())))
}

pub fn parse_problem(raw: &str, strict: bool) -> Result<ProblemSpec, ConfigError> {
    let mut ignored_keys = std::collections::BTreeSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(raw);
    let spec: ProblemSpec = serde_ignored::deserialize(deserializer, |p| {
        ignored_keys.insert(p.to_string());
    })
    .map_err(|e| ConfigError(format!("failed to parse problem YAML: {}", e)))?;

    let meaningful: Vec<_> = ignored_keys
        .iter()
        .filter(|k| !k.starts_with('_') && !k.starts_with("x-"))
        .collect();
    if !meaningful.is_empty() {
        if strict {
            return Err(ConfigError(format!(
                "Unknown fields detected in strict mode: {:?}",
                meaningful
            )));
        }
        tracing::warn!(event = "problem_unknown_fields", problem = %spec.id, fields = ?meaningful);
    }

    validate_problem(&spec)?;
    Ok(spec)
}

/// Structural invariants: unique table names, unique column names per table,
/// declared columns for inline tables, no reserved engine names.
pub fn validate_problem(spec: &ProblemSpec) -> Result<(), ConfigError> {
    if spec.id.trim().is_empty() {
        return Err(ConfigError("problem id is empty".into()));
    }
    if spec.tables.is_empty() {
        return Err(ConfigError(format!("problem '{}' defines no tables", spec.id)));
    }

    let mut tables = HashSet::new();
    for t in &spec.tables {
        let lname = t.name.to_ascii_lowercase();
        if lname.trim().is_empty() {
            return Err(ConfigError(format!("problem '{}' has a table without a name", spec.id)));
        }
        if lname.starts_with("sqlite_") {
            return Err(ConfigError(format!(
                "table name '{}' uses a reserved prefix",
                t.name
            )));
        }
        if !tables.insert(lname) {
            return Err(ConfigError(format!("duplicate table name '{}'", t.name)));
        }

        let mut cols = HashSet::new();
        for c in &t.columns {
            if c.name.trim().is_empty() {
                return Err(ConfigError(format!("table '{}' has an unnamed column", t.name)));
            }
            if !cols.insert(c.name.to_ascii_lowercase()) {
                return Err(ConfigError(format!(
                    "duplicate column '{}' in table '{}'",
                    c.name, t.name
                )));
            }
        }

        if matches!(t.source, TableSource::Inline { .. }) && t.columns.is_empty() {
            return Err(ConfigError(format!(
                "inline table '{}' must declare its columns",
                t.name
            )));
        }
    }

    match &spec.expected_output {
        ExpectedOutput::Literal { columns: Some(cols), .. } => {
            let mut seen = HashSet::new();
            for c in cols {
                if !seen.insert(c.to_ascii_lowercase()) {
                    return Err(ConfigError(format!(
                        "duplicate expected column '{}'",
                        c
                    )));
                }
            }
        }
        ExpectedOutput::Literal { columns: None, rows } if rows.is_empty() => {
            return Err(ConfigError(
                "an empty literal expected output must list its columns".into(),
            ));
        }
        _ => {}
    }

    Ok(())
}

pub fn write_sample_problem(path: &Path) -> Result<(), ConfigError> {
    std::fs::write(
        path,
        r#"id: sum-orders
title: Total order amount
tables:
  - name: orders
    columns:
      - { name: id, type: integer }
      - { name: amount, type: float }
    source:
      inline:
        rows:
          - [1, 10.0]
          - [2, 20.0]
expected_output:
  literal:
    rows:
      - { total: 30.0 }
"#,
    )
    .map_err(|e| ConfigError(format!("failed to write sample problem: {}", e)))?;
    Ok(())
}
