//! 请求面：校验提交参数、构造任务并交给调度器
//!
//! 参数非法（script 不是字符串，options/profile 不是对象）时立即以 BAD_ARGS 回调，不进入调度器。
//! `null` 的 options/profile 视为未提供。

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::core::error::HiveError;
use crate::core::scheduler::Scheduler;
use crate::core::task::{Task, TaskOptions, TaskReport};

/// 返回给调用方的错误文案
pub const BAD_ARGUMENTS: &str = "Bad arguments";

/// 校验通过的提交
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub script: String,
    pub options: TaskOptions,
    pub profile: Value,
}

impl Submission {
    pub fn into_task(self) -> Task {
        Task::new(self.script, self.options, self.profile)
    }
}

/// 解析 `{script, options?, profile?}`；错误为内部诊断信息，对外统一为 BAD_ARGUMENTS
pub fn parse_submission(body: &Value) -> Result<Submission, String> {
    let Some(body) = body.as_object() else {
        return Err("request body must be an object".to_string());
    };

    let script = match body.get("script") {
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err("script must be a string".to_string()),
        None => return Err("script is required".to_string()),
    };

    let options = match body.get("options") {
        None | Some(Value::Null) => TaskOptions::default(),
        Some(v @ Value::Object(_)) => serde_json::from_value(v.clone())
            .map_err(|e| format!("invalid options: {e}"))?,
        Some(_) => return Err("options must be an object".to_string()),
    };

    let profile = match body.get("profile") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(v @ Value::Object(_)) => v.clone(),
        Some(_) => return Err("profile must be an object".to_string()),
    };

    Ok(Submission {
        script,
        options,
        profile,
    })
}

/// 校验并提交；参数非法时同步回调 BAD_ARGS
pub fn submit<F>(scheduler: &Scheduler, body: &Value, callback: F) -> Result<(), HiveError>
where
    F: FnOnce(TaskReport) + Send + 'static,
{
    match parse_submission(body) {
        Ok(submission) => {
            let task = Arc::new(submission.into_task());
            tracing::debug!(task = %task.id(), "Task submitted");
            scheduler.process(task, callback)
        }
        Err(reason) => {
            tracing::warn!("Rejecting task submission: {}", reason);
            callback(TaskReport::bad_args(BAD_ARGUMENTS));
            Ok(())
        }
    }
}

/// 原始请求体入口；不是合法 JSON 时同样以 BAD_ARGS 回调
pub fn submit_body<F>(scheduler: &Scheduler, body: &[u8], callback: F) -> Result<(), HiveError>
where
    F: FnOnce(TaskReport) + Send + 'static,
{
    match serde_json::from_slice::<Value>(body) {
        Ok(body) => submit(scheduler, &body, callback),
        Err(e) => {
            tracing::warn!("Rejecting malformed request body: {}", e);
            callback(TaskReport::bad_args(BAD_ARGUMENTS));
            Ok(())
        }
    }
}

/// DONE 返回 200，其他终态一律 500
pub fn response_status(report: &TaskReport) -> u16 {
    if report.is_success() {
        200
    } else {
        500
    }
}

pub fn response_body(report: &TaskReport) -> Value {
    serde_json::to_value(report).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgentProvider;
    use crate::core::scheduler::SchedulerConfig;
    use crate::core::task::TaskStatus;
    use crate::script::Interpreter;
    use serde_json::json;
    use tokio::sync::oneshot;

    #[test]
    fn test_parse_full_submission() {
        let submission = parse_submission(&json!({
            "script": "resolve(1)",
            "options": {"queueTimeoutMs": 10, "trace": true},
            "profile": {"cookies": []}
        }))
        .unwrap();
        assert_eq!(submission.script, "resolve(1)");
        assert_eq!(submission.options.queue_timeout_ms, Some(10));
        assert_eq!(submission.options.extra.get("trace"), Some(&json!(true)));
        assert_eq!(submission.profile, json!({"cookies": []}));
    }

    #[test]
    fn test_null_options_and_profile_are_absent() {
        let submission =
            parse_submission(&json!({"script": "", "options": null, "profile": null})).unwrap();
        assert_eq!(submission.options, TaskOptions::default());
        assert_eq!(submission.profile, json!({}));
    }

    #[test]
    fn test_bad_arguments() {
        assert!(parse_submission(&json!({})).is_err());
        assert!(parse_submission(&json!({"script": 42})).is_err());
        assert!(parse_submission(&json!({"script": "", "options": "x"})).is_err());
        assert!(parse_submission(&json!({"script": "", "profile": [1]})).is_err());
        assert!(parse_submission(&json!({"script": "", "options": {"sessionTimeoutMs": "soon"}}))
            .is_err());
        assert!(parse_submission(&json!("resolve(1)")).is_err());
    }

    #[tokio::test]
    async fn test_missing_script_reports_bad_args() {
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            Arc::new(MockAgentProvider::new()),
            Arc::new(Interpreter::new()),
        )
        .unwrap();
        let (tx, rx) = oneshot::channel();
        submit(&scheduler, &json!({"options": {}}), move |report| {
            let _ = tx.send(report);
        })
        .unwrap();

        let report = rx.await.unwrap();
        assert_eq!(report.status, TaskStatus::BadArgs);
        assert_eq!(report.error.as_deref(), Some(BAD_ARGUMENTS));
        assert!(report.timings.is_none());
        assert_eq!(scheduler.counter_total(), 0);
        assert_eq!(scheduler.pool_length(), 0);
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(
            SchedulerConfig::default(),
            Arc::new(MockAgentProvider::new()),
            Arc::new(Interpreter::new()),
        )
        .unwrap()
    }

    async fn submit_raw(scheduler: &Scheduler, body: &[u8]) -> TaskReport {
        let (tx, rx) = oneshot::channel();
        submit_body(scheduler, body, move |report| {
            let _ = tx.send(report);
        })
        .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_malformed_body_reports_bad_args() {
        let scheduler = scheduler();
        let bodies: [&[u8]; 4] = [b"{not json", b"", b"\xff\xfe", b"{\"script\": \"resolve(1)\""];
        for body in bodies {
            let report = submit_raw(&scheduler, body).await;
            assert_eq!(report.status, TaskStatus::BadArgs);
            assert_eq!(response_status(&report), 500);
            assert_eq!(
                response_body(&report),
                json!({
                    "status": "BAD_ARGS",
                    "timings": null,
                    "options": null,
                    "profile": null,
                    "output": null,
                    "error": "Bad arguments"
                })
            );
        }
        assert_eq!(scheduler.counter_total(), 0);
    }

    #[tokio::test]
    async fn test_response_status_by_outcome() {
        let scheduler = scheduler();

        let done = submit_raw(&scheduler, br#"{"script": "resolve(1)"}"#).await;
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(response_status(&done), 200);
        let body = response_body(&done);
        assert_eq!(body["status"], json!("DONE"));
        assert_eq!(body["output"], json!(1));
        assert!(body["id"].is_string());

        let failed = submit_raw(&scheduler, br#"{"script": "reject('nope')"}"#).await;
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(response_status(&failed), 500);
        assert_eq!(response_body(&failed)["error"], json!("nope"));

        let bad = submit_raw(&scheduler, br#"{"script": 1}"#).await;
        assert_eq!(response_status(&bad), 500);
        assert!(response_body(&bad).get("id").is_none());
    }

    #[tokio::test]
    async fn test_submit_runs_script() {
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            Arc::new(MockAgentProvider::new()),
            Arc::new(Interpreter::new()),
        )
        .unwrap();
        let (tx, rx) = oneshot::channel();
        submit(
            &scheduler,
            &json!({"script": "resolve(profile.n * 2)", "profile": {"n": 21}}),
            move |report| {
                let _ = tx.send(report);
            },
        )
        .unwrap();

        let report = rx.await.unwrap();
        assert_eq!(report.status, TaskStatus::Done);
        assert_eq!(report.output, json!(42));
        assert_eq!(report.error, None);
    }
}
