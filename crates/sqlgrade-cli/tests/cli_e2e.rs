use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

const SUM: &str = "SELECT SUM(amount) AS total FROM orders";

fn sqlgrade(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("sqlgrade").unwrap();
    cmd.current_dir(dir.path()).env_remove("SQLGRADE_OBJECT_ENDPOINT");
    cmd
}

fn initialized() -> TempDir {
    let dir = TempDir::new().unwrap();
    sqlgrade(&dir).arg("init").assert().success();
    assert!(dir.path().join("sqlgrade.yaml").exists());
    assert!(dir.path().join("problems/sum-orders.yaml").exists());
    dir
}

#[test]
fn test_submit_replay_and_stats() {
    let dir = initialized();

    sqlgrade(&dir)
        .args(["submit", "sum-orders", "--sql", SUM, "--submission-id", "s1"])
        .assert()
        .code(0)
        .stdout(contains("s1: correct"));

    let out = sqlgrade(&dir)
        .args(["submit", "sum-orders", "--sql", SUM, "--submission-id", "s1", "--format", "json"])
        .assert()
        .code(0)
        .get_output()
        .stdout
        .clone();
    let res: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(res["outcome"], "correct");
    assert_eq!(res["submission_id"], "s1");

    sqlgrade(&dir)
        .args(["stats", "--user", "cli", "--problem", "sum-orders"])
        .assert()
        .success()
        .stdout(contains("\"attempts\": 1"));
}

#[test]
fn test_wrong_answer_exits_one() {
    let dir = initialized();
    sqlgrade(&dir)
        .args(["submit", "sum-orders", "--sql", "SELECT 1 AS total"])
        .assert()
        .code(1)
        .stdout(contains("incorrect"));

    sqlgrade(&dir)
        .args(["submit", "sum-orders", "--sql", "DROP TABLE orders"])
        .assert()
        .code(1)
        .stdout(contains("runtime_error"));
}

#[test]
fn test_run_prints_rows_from_file() {
    let dir = initialized();
    sqlgrade(&dir)
        .args(["run", "sum-orders", "--file", "problems/sum-orders.sql"])
        .assert()
        .success()
        .stdout(contains("total"))
        .stdout(contains("30"));
}

#[test]
fn test_self_check_passes_for_sample() {
    let dir = initialized();
    sqlgrade(&dir)
        .args(["self-check", "--format", "json"])
        .assert()
        .success()
        .stdout(contains("ground_truth"));
}

#[test]
fn test_unknown_problem_is_config_error() {
    let dir = initialized();
    sqlgrade(&dir)
        .args(["submit", "nope", "--sql", SUM])
        .assert()
        .code(2)
        .stderr(contains("E_PROBLEM_NOT_FOUND"));
}

#[test]
fn test_validate_dataset_failures() {
    let dir = initialized();
    sqlgrade(&dir)
        .args(["validate-dataset", "datasets/missing.parquet"])
        .assert()
        .code(1);

    sqlgrade(&dir)
        .args(["validate-dataset", "not-a-ref"])
        .assert()
        .code(2);
}

#[test]
fn test_version() {
    let dir = TempDir::new().unwrap();
    sqlgrade(&dir)
        .arg("version")
        .assert()
        .success()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}
