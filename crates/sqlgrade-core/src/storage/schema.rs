pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS submissions (
  submission_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  problem_id TEXT NOT NULL,
  fingerprint TEXT NOT NULL,
  outcome TEXT NOT NULL,
  error_kind TEXT,
  result_json TEXT NOT NULL,
  execution_time_ms INTEGER NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_submissions_user_problem
  ON submissions(user_id, problem_id);

CREATE TABLE IF NOT EXISTS attempt_counters (
  user_id TEXT NOT NULL,
  problem_id TEXT NOT NULL,
  attempts INTEGER NOT NULL DEFAULT 0,
  correct INTEGER NOT NULL DEFAULT 0,
  first_correct_at TEXT,
  last_outcome TEXT,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, problem_id)
);

PRAGMA user_version = 1;
"#;
