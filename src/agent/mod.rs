//! Agent 层：Agent 句柄与 AgentProvider 抽象
//!
//! 调度器只依赖 `acquire(config) -> agent` / `release(agent)` 两个操作；
//! 具体实现有 Mock（内存页面，测试用）与 Chrome（feature "browser"）。

#[cfg(feature = "browser")]
pub mod chrome;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::AgentSection;

#[cfg(feature = "browser")]
pub use chrome::ChromeAgentProvider;
pub use mock::{MockAgent, MockAgentProvider, MockPage};

/// Agent 相关错误（启动、导航、求值、回收）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("Navigate failed: {0}")]
    Navigation(String),

    #[error("Evaluate failed: {0}")]
    Evaluation(String),

    #[error("Release failed: {0}")]
    Release(String),

    #[error("Unknown agent provider: {0}")]
    UnknownProvider(String),
}

/// 获取 Agent 时使用的代理与资源拦截策略
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentConfig {
    pub proxy_url: Option<String>,
    pub blocked_resource_types: Vec<String>,
}

/// 托管的有状态执行上下文（如一个浏览器标签页），由脚本通过 `agent.xxx()` 调用
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    async fn goto(&self, url: &str) -> Result<(), AgentError>;

    async fn url(&self) -> Result<String, AgentError>;

    async fn title(&self) -> Result<String, AgentError>;

    async fn content(&self) -> Result<String, AgentError>;

    async fn evaluate(&self, expression: &str) -> Result<Value, AgentError>;
}

/// Agent 提供方：分配与回收；同一 Agent 不会同时分给两个任务
#[async_trait]
pub trait AgentProvider: Send + Sync {
    async fn acquire(&self, config: &AgentConfig) -> Result<Arc<dyn Agent>, AgentError>;

    async fn release(&self, agent: Arc<dyn Agent>) -> Result<(), AgentError>;
}

/// 资源类型 → 拦截用的 URL 通配模式；未知类型忽略
pub fn blocked_url_patterns(resource_types: &[String]) -> Vec<String> {
    let mut patterns = Vec::new();
    for kind in resource_types {
        let exts: &[&str] = match kind.to_lowercase().as_str() {
            "image" => &["png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "bmp"],
            "stylesheet" => &["css"],
            "font" => &["woff", "woff2", "ttf", "otf", "eot"],
            "media" => &["mp4", "webm", "ogg", "mp3", "wav", "avi", "mov"],
            _ => {
                tracing::debug!(resource_type = %kind, "no url pattern for resource type");
                &[]
            }
        };
        for ext in exts {
            let pattern = format!("*.{ext}");
            if !patterns.contains(&pattern) {
                patterns.push(pattern);
            }
        }
    }
    patterns
}

/// 按 [agent] 配置创建 Provider
pub fn create_provider(section: &AgentSection) -> Result<Arc<dyn AgentProvider>, AgentError> {
    match section.provider.as_str() {
        "mock" => {
            tracing::warn!("Using mock agent provider, scripts will not reach real pages");
            Ok(Arc::new(MockAgentProvider::new()))
        }
        #[cfg(feature = "browser")]
        "chrome" => Ok(Arc::new(ChromeAgentProvider::new(section.headless))),
        other => Err(AgentError::UnknownProvider(other.to_string())),
    }
}
