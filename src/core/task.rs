//! 任务：脚本 + 选项 + profile + 计时 + 状态机
//!
//! 核心保证：`fulfill` 恰好生效一次。调度器的强制超时与脚本的自然完成可能同时到达，
//! 先到者生效，后到者只记一条 warn 日志。
//!
//! 执行步骤（`run`）与「已完成」令牌竞争：任务一旦被其他路径完成，执行步骤立即以
//! AlreadyFulfilled 断开，脚本之后的结果被丢弃。

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentConfig};
use crate::core::error::HiveError;
use crate::core::timings::Timings;
use crate::script::{ScriptContext, ScriptEngine, ScriptError, ScriptOutput};

/// 任务 ID
pub type TaskId = String;

/// 任务状态；除 Created 外均为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Done,
    Failed,
    TimedOut,
    BadArgs,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Created)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "CREATED",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::TimedOut => "TIMED_OUT",
            TaskStatus::BadArgs => "BAD_ARGS",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务选项：超时与 Agent 策略的覆盖项；未知键原样保留并回显
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_proxy_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_resource_types: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskOptions {
    /// 用任务自身的覆盖项修正调度器默认的 Agent 配置
    pub fn agent_config(&self, defaults: &AgentConfig) -> AgentConfig {
        AgentConfig {
            proxy_url: self
                .upstream_proxy_url
                .clone()
                .or_else(|| defaults.proxy_url.clone()),
            blocked_resource_types: self
                .blocked_resource_types
                .clone()
                .unwrap_or_else(|| defaults.blocked_resource_types.clone()),
        }
    }
}

/// 终态报告：回调参数，也是 HTTP 响应体
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    pub status: TaskStatus,
    pub timings: Option<Timings>,
    pub options: Option<TaskOptions>,
    pub profile: Option<Value>,
    pub output: Value,
    pub error: Option<String>,
}

impl TaskReport {
    /// 参数非法时的报告，不经过调度器
    pub fn bad_args(message: impl Into<String>) -> Self {
        Self {
            id: None,
            status: TaskStatus::BadArgs,
            timings: None,
            options: None,
            profile: None,
            output: Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Done
    }
}

/// 完成回调
pub type TaskCallback = Box<dyn FnOnce(TaskReport) + Send + 'static>;

struct TaskState {
    status: TaskStatus,
    output: Value,
    error: Option<String>,
    profile: Value,
    timings: Timings,
    fulfilled: bool,
    submitted: bool,
    callback: Option<TaskCallback>,
}

/// 一次脚本执行请求
pub struct Task {
    id: TaskId,
    script: String,
    options: TaskOptions,
    state: Mutex<TaskState>,
    /// fulfill 时取消；执行步骤的看门狗监听它
    fulfilled: CancellationToken,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

impl Task {
    pub fn new(script: impl Into<String>, options: TaskOptions, profile: Value) -> Self {
        let profile = if profile.is_null() {
            Value::Object(Map::new())
        } else {
            profile
        };
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            script: script.into(),
            options,
            state: Mutex::new(TaskState {
                status: TaskStatus::Created,
                output: Value::Null,
                error: None,
                profile,
                timings: Timings::new(),
                fulfilled: false,
                submitted: false,
                callback: None,
            }),
            fulfilled: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    pub fn output(&self) -> Value {
        self.state.lock().output.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn profile(&self) -> Value {
        self.state.lock().profile.clone()
    }

    pub fn timings(&self) -> Timings {
        self.state.lock().timings.clone()
    }

    pub fn is_fulfilled(&self) -> bool {
        self.state.lock().fulfilled
    }

    pub fn report(&self) -> TaskReport {
        let state = self.state.lock();
        self.report_locked(&state)
    }

    fn report_locked(&self, state: &TaskState) -> TaskReport {
        TaskReport {
            id: Some(self.id.clone()),
            status: state.status,
            timings: Some(state.timings.clone()),
            options: Some(self.options.clone()),
            profile: Some(state.profile.clone()),
            output: state.output.clone(),
            error: state.error.clone(),
        }
    }

    /// 绑定完成回调；每个任务只能提交一次
    pub(crate) fn attach(&self, callback: TaskCallback) -> Result<(), HiveError> {
        let mut state = self.state.lock();
        if state.fulfilled {
            return Err(HiveError::AlreadyFulfilled(self.id.clone()));
        }
        if state.submitted {
            return Err(HiveError::AlreadySubmitted(self.id.clone()));
        }
        state.submitted = true;
        state.callback = Some(callback);
        Ok(())
    }

    pub(crate) fn mark_started(&self) {
        self.state.lock().timings.start();
    }

    /// 终态转换；返回本次调用是否生效。回调在释放锁之后调用。
    pub fn fulfill(
        &self,
        status: TaskStatus,
        output: Value,
        error: Option<String>,
        profile: Option<Value>,
    ) -> bool {
        if !status.is_terminal() {
            tracing::warn!(task = %self.id, "Task: fulfill called with non-terminal status");
            return false;
        }
        let (callback, report) = {
            let mut state = self.state.lock();
            if state.fulfilled {
                tracing::warn!(
                    task = %self.id,
                    status = %status,
                    current = %state.status,
                    "Task: already fulfilled"
                );
                return false;
            }
            state.fulfilled = true;
            state.timings.end();
            state.status = status;
            state.output = output;
            state.error = error;
            if let Some(profile) = profile {
                state.profile = profile;
            }
            let callback = state.callback.take();
            let report = callback.as_ref().map(|_| self.report_locked(&state));
            (callback, report)
        };

        self.fulfilled.cancel();

        if let (Some(callback), Some(report)) = (callback, report) {
            callback(report);
        }
        true
    }

    /// 执行步骤：把脚本交给解释器，并与「已被完成」信号竞争
    ///
    /// 自然结束时由这里调用 fulfill（DONE / FAILED）；若任务已被强制完成，
    /// 返回 `ScriptError::AlreadyFulfilled` 且不改动任务状态。
    pub async fn run(
        &self,
        agent: Arc<dyn Agent>,
        engine: Arc<dyn ScriptEngine>,
    ) -> Result<ScriptOutput, ScriptError> {
        if self.fulfilled.is_cancelled() {
            return Err(ScriptError::AlreadyFulfilled);
        }
        let ctx = ScriptContext {
            agent,
            profile: self.profile(),
            options: serde_json::to_value(&self.options).unwrap_or(Value::Null),
            cancel: self.fulfilled.child_token(),
        };

        let result = tokio::select! {
            biased;
            _ = self.fulfilled.cancelled() => Err(ScriptError::AlreadyFulfilled),
            result = engine.run(&self.script, ctx) => result,
        };

        match &result {
            Ok(output) => {
                self.fulfill(
                    TaskStatus::Done,
                    output.value.clone(),
                    None,
                    output.profile.clone(),
                );
            }
            Err(ScriptError::AlreadyFulfilled) | Err(ScriptError::Cancelled)
                if self.fulfilled.is_cancelled() =>
            {
                tracing::info!(task = %self.id, "{}", ScriptError::AlreadyFulfilled);
                return Err(ScriptError::AlreadyFulfilled);
            }
            Err(e) => {
                tracing::warn!(task = %self.id, "Task: Script: {}", e);
                self.fulfill(TaskStatus::Failed, Value::Null, Some(e.to_string()), None);
            }
        }
        result
    }
}
