//! 脚本引擎：可插拔解释器接口与内置 DSL
//!
//! 脚本被视为交给解释器的不透明程序，只能访问显式绑定的 `agent`、`profile`、`options`，
//! 通过 `resolve(v)` / `reject(v)` / `throw v` 结束。取消令牌在语句边界、sleep 与 Agent 调用处检查。
//!
//! 注意：这是隔离「意图」而非真正的沙箱；真正的 OS 级隔离需由外部执行边界提供。

pub mod interpreter;
pub mod lexer;
pub mod parser;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;

pub use interpreter::Interpreter;

/// 脚本执行错误；Display 即写入 Task.error 的字符串
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("SyntaxError: {message} (line {line})")]
    Syntax { line: usize, message: String },

    /// 脚本主动抛出 / reject 的值：字符串原样输出，其他值输出 JSON
    #[error("{}", display_value(.0))]
    Thrown(Value),

    #[error("Error: {0}")]
    Runtime(String),

    #[error("AgentError: {0}")]
    Agent(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Task: Execution: fulfilled before execution ended, aborting.")]
    AlreadyFulfilled,
}

/// 脚本可见的全部输入
pub struct ScriptContext {
    pub agent: Arc<dyn Agent>,
    pub profile: Value,
    pub options: Value,
    pub cancel: CancellationToken,
}

/// 成功结果：输出值，以及脚本通过 setProfile 替换的 profile
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutput {
    pub value: Value,
    pub profile: Option<Value>,
}

/// 解释器接口；可替换为字节码沙箱或子进程执行边界
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    async fn run(&self, program: &str, ctx: ScriptContext) -> Result<ScriptOutput, ScriptError>;
}

/// 值的字符串形式（字符串不带引号，整数不带小数点）
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
