use crate::catalog::ProblemCatalog;
use crate::compare::{compare_detailed, Mismatch};
use crate::config::{EffectiveSettings, EngineConfig};
use crate::dataset::{DatasetCache, ReferenceSolution, ResolvedTable, Resolver};
use crate::engine::{self, statement};
use crate::errors::{
    DatasetError, ExecutionError, GradeError, ProvisionError, StageError,
    GENERIC_PLATFORM_MESSAGE,
};
use crate::fingerprint;
use crate::grading::rate_limit::RateLimiter;
use crate::grading::state::{AttemptState, AttemptTracker};
use crate::model::{
    Caller, ErrorKind, ExpectedOutput, GradingOutcome, GradingResult, ProblemSpec, ResultSet,
    RunError, TableSource, TestRunResult,
};
use crate::redaction::Redactor;
use crate::sandbox::SandboxSession;
use crate::storage::{ObjectStore, RecordOutcome, SubmissionStore};
use crate::validate::{self, DatasetValidator, SelfCheckReport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, Semaphore};

type InFlight = Arc<OnceCell<GradingResult>>;

/// Runs test runs and graded submissions against authored problems.
///
/// Shared across requests: the dataset cache, the rate limiter, the sandbox
/// pool and the table of submissions currently being graded. Everything
/// else lives and dies with one attempt.
pub struct Grader {
    config: EngineConfig,
    catalog: Arc<dyn ProblemCatalog>,
    resolver: Resolver,
    store: Arc<dyn SubmissionStore>,
    limiter: RateLimiter,
    sandboxes: Arc<Semaphore>,
    redactor: Redactor,
    in_flight: Mutex<HashMap<String, (String, InFlight)>>,
}

struct Evaluation {
    candidate: ResultSet,
    mismatch: Option<Mismatch>,
}

impl Grader {
    pub fn new(
        config: EngineConfig,
        catalog: Arc<dyn ProblemCatalog>,
        objects: Arc<dyn ObjectStore>,
        store: Arc<dyn SubmissionStore>,
    ) -> Self {
        let cache = Arc::new(DatasetCache::new(objects, &config.cache));
        Self::with_cache(config, catalog, cache, store)
    }

    pub fn with_cache(
        config: EngineConfig,
        catalog: Arc<dyn ProblemCatalog>,
        cache: Arc<DatasetCache>,
        store: Arc<dyn SubmissionStore>,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(&config.rate_limit),
            sandboxes: Arc::new(Semaphore::new(config.max_concurrent_sandboxes.max(1))),
            resolver: Resolver::new(cache),
            redactor: Redactor::new(),
            in_flight: Mutex::new(HashMap::new()),
            config,
            catalog,
            store,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<DatasetCache> {
        self.resolver.cache()
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<dyn SubmissionStore> {
        &self.store
    }

    pub fn problem(&self, problem_id: &str) -> Result<Arc<ProblemSpec>, GradeError> {
        self.catalog
            .get(problem_id)?
            .ok_or_else(|| GradeError::ProblemNotFound(problem_id.to_string()))
    }

    pub fn validator(&self) -> DatasetValidator {
        DatasetValidator::new(
            self.cache().store().clone(),
            &self.config.validation,
            Duration::from_millis(self.config.timeouts.fetch_timeout_ms),
        )
    }

    /// Author-time check that a problem can be graded at all.
    pub async fn self_check(&self, problem_id: &str) -> Result<SelfCheckReport, GradeError> {
        let problem = self.problem(problem_id)?;
        Ok(validate::self_check(&problem, &self.resolver, &self.config).await)
    }

    /// Executes `sql` and returns its raw output. Nothing is compared or persisted.
    pub async fn run_test(
        &self,
        caller: &Caller,
        problem_id: &str,
        sql: &str,
    ) -> Result<TestRunResult, GradeError> {
        let problem = self.problem(problem_id)?;
        let _permit = self.limiter.admit(&caller.user_id, problem_id)?;
        let settings = self.config.effective(&problem);
        let redactor = self.redactor_for(&problem);
        let mut tracker = AttemptTracker::new(problem_id);

        let outcome = tokio::time::timeout(
            settings.attempt_timeout,
            self.test_run(&problem, sql, &settings, &redactor, &mut tracker),
        )
        .await
        .unwrap_or(Err(StageError::AttemptTimeout {
            timeout_ms: settings.attempt_timeout.as_millis() as u64,
        }));

        let mut result = TestRunResult {
            problem_id: problem_id.to_string(),
            columns: Vec::new(),
            rows: Vec::new(),
            truncated: false,
            execution_time_ms: 0,
            error: None,
        };
        match outcome {
            Ok(rs) => {
                tracker.enter(AttemptState::Done);
                result.truncated = rs.rows.len() > settings.preview_rows;
                result.rows = rs.preview(settings.preview_rows);
                result.columns = rs.columns;
            }
            Err(e) => {
                self.note_failure(&mut tracker, problem_id, &e);
                let (_, kind, message) = describe_failure(&e);
                result.error = Some(RunError { kind, message });
            }
        }
        result.execution_time_ms = tracker.execution_time_ms();
        Ok(result)
    }

    /// Grades a submission exactly once per `submission_id`.
    ///
    /// A replay of a finished submission returns the stored result; a replay
    /// racing the first call waits for it. Reusing an id for different
    /// content is a conflict.
    pub async fn submit(
        &self,
        caller: &Caller,
        problem_id: &str,
        sql: &str,
        submission_id: &str,
    ) -> Result<GradingResult, GradeError> {
        let fp = fingerprint::compute(fingerprint::Context {
            problem_id,
            user_id: &caller.user_id,
            sql,
        })
        .hex;

        if let Some(existing) = self.store.get_submission(submission_id)? {
            if existing.fingerprint != fp {
                return Err(GradeError::SubmissionConflict(submission_id.to_string()));
            }
            tracing::info!(event = "submission_replayed", submission = %submission_id);
            return Ok(existing.result);
        }

        let cell = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(submission_id) {
                Some((other, _)) if *other != fp => {
                    return Err(GradeError::SubmissionConflict(submission_id.to_string()))
                }
                Some((_, cell)) => cell.clone(),
                None => {
                    let cell: InFlight = Arc::new(OnceCell::new());
                    in_flight.insert(submission_id.to_string(), (fp.clone(), cell.clone()));
                    cell
                }
            }
        };

        let graded = cell
            .get_or_try_init(|| self.grade(caller, problem_id, sql, submission_id, &fp))
            .await
            .cloned();

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if matches!(in_flight.get(submission_id), Some((_, c)) if Arc::ptr_eq(c, &cell)) {
                in_flight.remove(submission_id);
            }
        }
        graded
    }

    async fn grade(
        &self,
        caller: &Caller,
        problem_id: &str,
        sql: &str,
        submission_id: &str,
        fp: &str,
    ) -> Result<GradingResult, GradeError> {
        let problem = self.problem(problem_id)?;
        let _permit = self.limiter.admit(&caller.user_id, problem_id)?;
        let settings = self.config.effective(&problem);
        let redactor = self.redactor_for(&problem);
        let mut tracker = AttemptTracker::new(problem_id);

        let outcome = tokio::time::timeout(
            settings.attempt_timeout,
            self.evaluate(&problem, sql, &settings, &redactor, &mut tracker),
        )
        .await
        .unwrap_or(Err(StageError::AttemptTimeout {
            timeout_ms: settings.attempt_timeout.as_millis() as u64,
        }));

        let mut result = match outcome {
            Ok(eval) => {
                tracker.enter(AttemptState::Done);
                let (outcome, diagnostic) = match eval.mismatch {
                    None => (GradingOutcome::Correct, None),
                    Some(m) => (GradingOutcome::Incorrect, Some(m.to_string())),
                };
                GradingResult {
                    submission_id: None,
                    problem_id: problem_id.to_string(),
                    outcome,
                    error_kind: None,
                    candidate_preview: eval.candidate.preview(settings.preview_rows),
                    candidate_columns: eval.candidate.columns,
                    diagnostic_message: diagnostic,
                    execution_time_ms: 0,
                }
            }
            Err(e) => {
                self.note_failure(&mut tracker, problem_id, &e);
                let (outcome, kind, message) = describe_failure(&e);
                GradingResult::failed(problem_id, outcome, kind, message, 0)
            }
        };
        result.submission_id = Some(submission_id.to_string());
        result.execution_time_ms = tracker.execution_time_ms();

        match self.store.record(&caller.user_id, fp, &result)? {
            RecordOutcome::Inserted => {
                tracing::info!(
                    event = "submission_graded",
                    submission = %submission_id,
                    problem = %problem_id,
                    outcome = result.outcome.as_str(),
                    elapsed_ms = tracker.elapsed_ms(),
                );
                Ok(result)
            }
            RecordOutcome::Existing(stored) if stored.fingerprint == fp => Ok(stored.result),
            RecordOutcome::Existing(_) => {
                Err(GradeError::SubmissionConflict(submission_id.to_string()))
            }
        }
    }

    async fn evaluate(
        &self,
        problem: &ProblemSpec,
        sql: &str,
        settings: &EffectiveSettings,
        redactor: &Redactor,
        tracker: &mut AttemptTracker,
    ) -> Result<Evaluation, StageError> {
        let tables = self.resolve_for_candidate(problem, sql, settings, tracker).await?;

        let reference = match &problem.expected_output {
            ExpectedOutput::ReferenceSolution(r) => Some(
                self.resolver
                    .load_reference(r, settings.fetch_timeout, settings.sandbox.max_result_rows as u64)
                    .await
                    .map_err(|e| StageError::Reference(e.to_string()))?,
            ),
            ExpectedOutput::Literal { .. } => None,
        };
        let reference_tables = matches!(reference, Some(ReferenceSolution::Query(_)))
            .then(|| tables.clone());

        let candidate = self.run_candidate(tables, sql, settings, redactor, tracker).await?;

        tracker.enter(AttemptState::Comparing);
        let expected = match reference {
            None => problem.expected_output.literal_result_set().unwrap_or_default(),
            Some(ReferenceSolution::Output(rs)) => rs,
            Some(ReferenceSolution::Query(reference_sql)) => {
                let tables = reference_tables.unwrap_or_default();
                self.run_reference(tables, &reference_sql, settings).await?
            }
        };

        let policy = settings.comparison;
        let mismatch = compare_detailed(&candidate, &expected, &policy).err();
        Ok(Evaluation {
            candidate,
            mismatch,
        })
    }

    async fn test_run(
        &self,
        problem: &ProblemSpec,
        sql: &str,
        settings: &EffectiveSettings,
        redactor: &Redactor,
        tracker: &mut AttemptTracker,
    ) -> Result<ResultSet, StageError> {
        let tables = self.resolve_for_candidate(problem, sql, settings, tracker).await?;
        self.run_candidate(tables, sql, settings, redactor, tracker).await
    }

    /// Rejects malformed statements before paying for datasets, then resolves.
    async fn resolve_for_candidate(
        &self,
        problem: &ProblemSpec,
        sql: &str,
        settings: &EffectiveSettings,
        tracker: &mut AttemptTracker,
    ) -> Result<Vec<ResolvedTable>, StageError> {
        statement::inspect(sql)?;
        tracker.enter(AttemptState::Resolving);
        Ok(self
            .resolver
            .resolve(&problem.tables, settings.fetch_timeout)
            .await?)
    }

    async fn run_candidate(
        &self,
        tables: Vec<ResolvedTable>,
        sql: &str,
        settings: &EffectiveSettings,
        redactor: &Redactor,
        tracker: &mut AttemptTracker,
    ) -> Result<ResultSet, StageError> {
        tracker.enter(AttemptState::Provisioning);
        let _slot = self.sandbox_slot().await?;
        let mut session =
            SandboxSession::provision(tables, &settings.sandbox, settings.load_timeout).await?;

        tracker.enter(AttemptState::Executing);
        let started = Instant::now();
        let result = engine::execute(&mut session, sql, settings.query_timeout, redactor).await;
        tracker.record_query_ms(started.elapsed().as_millis() as u64);
        Ok(result?)
    }

    /// Ground truth from a stored query, in its own sandbox under the candidate's rules.
    async fn run_reference(
        &self,
        tables: Vec<ResolvedTable>,
        sql: &str,
        settings: &EffectiveSettings,
    ) -> Result<ResultSet, StageError> {
        let _slot = self.sandbox_slot().await?;
        let mut session = SandboxSession::provision(tables, &settings.sandbox, settings.load_timeout)
            .await
            .map_err(|e| StageError::Reference(e.to_string()))?;
        engine::execute(&mut session, sql, settings.query_timeout, &Redactor::new())
            .await
            .map_err(|e| StageError::Reference(e.to_string()))
    }

    async fn sandbox_slot(&self) -> Result<tokio::sync::OwnedSemaphorePermit, StageError> {
        self.sandboxes
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecutionError::Internal("sandbox pool closed".into()).into())
    }

    /// Storage locations of this problem are never echoed back to the learner.
    fn redactor_for(&self, problem: &ProblemSpec) -> Redactor {
        let mut redactor = self.redactor.clone();
        let refs = problem.tables.iter().filter_map(|t| match &t.source {
            TableSource::Remote(r) => Some(r),
            TableSource::Inline { .. } => None,
        });
        let reference = match &problem.expected_output {
            ExpectedOutput::ReferenceSolution(r) => Some(r),
            ExpectedOutput::Literal { .. } => None,
        };
        for r in refs.chain(reference) {
            redactor.add_secret(r.key.clone());
            redactor.add_secret(r.bucket.clone());
        }
        redactor
    }

    fn note_failure(&self, tracker: &mut AttemptTracker, problem_id: &str, e: &StageError) {
        if e.is_platform_incident() {
            tracing::error!(
                event = "platform_incident",
                problem = %problem_id,
                stage = tracker.state().name(),
                error = %e,
            );
        } else {
            tracing::info!(
                event = "attempt_failed",
                problem = %problem_id,
                stage = tracker.state().name(),
                error = %e,
            );
        }
        tracker.fail(e.to_string());
    }
}

/// Outcome, error kind and learner-facing message for a failed attempt.
fn describe_failure(e: &StageError) -> (GradingOutcome, ErrorKind, String) {
    match e {
        StageError::Execution(x) if x.is_candidate_fault() => (x.outcome(), x.kind(), x.to_string()),
        StageError::AttemptTimeout { .. } => {
            (GradingOutcome::Timeout, ErrorKind::Timeout, e.to_string())
        }
        StageError::Provision(p @ ProvisionError::ResourceExceeded { .. }) => (
            GradingOutcome::ResourceExceeded,
            ErrorKind::ResourceExceeded,
            format!("This problem's data could not be loaded: {}", p),
        ),
        StageError::Dataset(d @ DatasetError::TooLarge { .. }) => (
            GradingOutcome::ResourceExceeded,
            ErrorKind::ResourceExceeded,
            format!("This problem's data could not be loaded: {}", d),
        ),
        StageError::Provision(_) => (
            GradingOutcome::InternalError,
            ErrorKind::ProvisionError,
            GENERIC_PLATFORM_MESSAGE.to_string(),
        ),
        StageError::Dataset(
            DatasetError::SchemaMismatch { .. }
            | DatasetError::DuplicateTable { .. }
            | DatasetError::DuplicateColumn { .. },
        ) => (
            GradingOutcome::InternalError,
            ErrorKind::SchemaMismatch,
            GENERIC_PLATFORM_MESSAGE.to_string(),
        ),
        _ => (
            GradingOutcome::InternalError,
            ErrorKind::InternalError,
            GENERIC_PLATFORM_MESSAGE.to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LimitKind;

    #[test]
    fn test_platform_failures_are_generic() {
        let e: StageError = DatasetError::Storage {
            reason: "connect to 10.0.0.7 refused".into(),
        }
        .into();
        let (outcome, kind, msg) = describe_failure(&e);
        assert_eq!(outcome, GradingOutcome::InternalError);
        assert_eq!(kind, ErrorKind::InternalError);
        assert_eq!(msg, GENERIC_PLATFORM_MESSAGE);
    }

    #[test]
    fn test_resource_exceeded_explains_limit() {
        let e: StageError = ProvisionError::ResourceExceeded {
            limit: LimitKind::RowsPerTable,
            table: Some("orders".into()),
            observed: 20,
            allowed: 10,
        }
        .into();
        let (outcome, kind, msg) = describe_failure(&e);
        assert_eq!(outcome, GradingOutcome::ResourceExceeded);
        assert_eq!(kind, ErrorKind::ResourceExceeded);
        assert!(msg.contains("max_rows_per_table"));
    }

    #[test]
    fn test_candidate_errors_pass_through() {
        let e: StageError = ExecutionError::Semantic("no such table: nonexistent_table".into()).into();
        let (outcome, kind, msg) = describe_failure(&e);
        assert_eq!(outcome, GradingOutcome::RuntimeError);
        assert_eq!(kind, ErrorKind::SemanticError);
        assert!(msg.contains("nonexistent_table"));

        let internal: StageError = ExecutionError::Internal("worker panicked".into()).into();
        assert_eq!(describe_failure(&internal).0, GradingOutcome::InternalError);
    }
}
