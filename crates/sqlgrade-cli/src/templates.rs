pub const GITIGNORE: &str = r#"# sqlgrade
.sqlgrade/
"#;

/// Reference query for the sample problem written by `sqlgrade init`.
pub const SAMPLE_QUERY: &str = "SELECT SUM(amount) AS total FROM orders\n";
