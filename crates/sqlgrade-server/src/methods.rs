use crate::cache::ReportCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlgrade_core::errors::{GradeError, GENERIC_PLATFORM_MESSAGE};
use sqlgrade_core::model::{Caller, ObjectRef};
use sqlgrade_core::Grader;
use std::sync::Arc;

pub struct MethodContext {
    pub grader: Arc<Grader>,
    pub reports: ReportCache,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MethodError {
    pub code: String,
    pub message: String,
}

impl MethodError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<GradeError> for MethodError {
    fn from(e: GradeError) -> Self {
        match &e {
            GradeError::Other(inner) => {
                tracing::error!(event = "platform_incident", error = %inner);
                MethodError::new(e.code(), GENERIC_PLATFORM_MESSAGE)
            }
            _ => MethodError::new(e.code(), e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunTestParams {
    user_id: String,
    problem_id: String,
    sql: String,
}

#[derive(Debug, Deserialize)]
struct SubmitParams {
    user_id: String,
    problem_id: String,
    sql: String,
    submission_id: String,
}

#[derive(Debug, Deserialize)]
struct ValidateParams {
    object: ObjectRef,
}

#[derive(Debug, Deserialize)]
struct ValidateManyParams {
    objects: Vec<ObjectRef>,
}

#[derive(Debug, Deserialize)]
struct SelfCheckParams {
    problem_id: String,
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, MethodError> {
    serde_json::from_value(params).map_err(|e| MethodError::new("E_INVALID_PARAMS", e.to_string()))
}

fn to_value<T: Serialize>(v: &T) -> Result<Value, MethodError> {
    serde_json::to_value(v).map_err(|e| MethodError::new("E_INTERNAL", e.to_string()))
}

pub const METHODS: &[&str] = &[
    "ping",
    "run_test",
    "submit",
    "validate_dataset",
    "validate_multi_table_dataset",
    "self_check",
];

pub async fn handle_call(
    ctx: &MethodContext,
    method: &str,
    params: Value,
) -> Result<Value, MethodError> {
    match method {
        "ping" => Ok(serde_json::json!({
            "pong": true,
            "version": env!("CARGO_PKG_VERSION"),
            "methods": METHODS,
        })),
        "run_test" => {
            let p: RunTestParams = parse(params)?;
            let out = ctx
                .grader
                .run_test(&Caller::new(p.user_id), &p.problem_id, &p.sql)
                .await?;
            to_value(&out)
        }
        "submit" => {
            let p: SubmitParams = parse(params)?;
            let res = ctx
                .grader
                .submit(&Caller::new(p.user_id), &p.problem_id, &p.sql, &p.submission_id)
                .await?;
            to_value(&res)
        }
        "validate_dataset" => {
            let p: ValidateParams = parse(params)?;
            if let Some(hit) = ctx.reports.get(&p.object) {
                tracing::debug!(event = "report_cache_hit", key = %p.object.key);
                return to_value(hit.as_ref());
            }
            let report = ctx
                .grader
                .validator()
                .validate(&p.object)
                .await
                .map_err(|e| MethodError::new("E_DATASET_INVALID", e.to_string()))?;
            let report = Arc::new(report);
            ctx.reports.insert(&p.object, report.clone());
            to_value(report.as_ref())
        }
        "validate_multi_table_dataset" => {
            let p: ValidateManyParams = parse(params)?;
            if p.objects.is_empty() {
                return Err(MethodError::new("E_INVALID_PARAMS", "objects must not be empty"));
            }
            let report = ctx.grader.validator().validate_many(&p.objects).await;
            to_value(&report)
        }
        "self_check" => {
            let p: SelfCheckParams = parse(params)?;
            let report = ctx.grader.self_check(&p.problem_id).await?;
            to_value(&report)
        }
        other => Err(MethodError::new(
            "E_METHOD_NOT_FOUND",
            format!("method not found: {}", other),
        )),
    }
}
