//! 错误类型
//!
//! - `HiveError`：构造期错误（配置非法、无 tokio 运行时、任务重复提交），同步返回给调用方
//! - `TaskError`：任务终态失败原因，字符串化后写入 Task.error，只经回调送达

use thiserror::Error;

/// 构造/提交阶段的错误；预期内的任务失败不走这里
#[derive(Error, Debug)]
pub enum HiveError {
    #[error("Invalid scheduler config: {0}")]
    InvalidConfig(String),

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Task {0} was already submitted")]
    AlreadySubmitted(String),

    #[error("Task {0} is already fulfilled")]
    AlreadyFulfilled(String),
}

/// 调度器强制结束任务时给出的原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Queue timeout: task waited more than {0}ms for a free slot")]
    QueueTimeout(u64),

    #[error("Session timeout: task ran longer than {0}ms")]
    SessionTimeout(u64),

    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("Scheduler closed")]
    SchedulerClosed,

    #[error("Execution aborted: {0}")]
    ExecutionAborted(String),
}
