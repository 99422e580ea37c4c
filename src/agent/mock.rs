//! Mock Agent（用于测试，无需浏览器）
//!
//! 页面内容来自内存表；记录 acquire / release 次数与每次的 AgentConfig，
//! 可配置获取延迟或获取失败，便于验证调度器的超时与回收路径。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::agent::{Agent, AgentConfig, AgentError, AgentProvider};

/// 内存页面
#[derive(Debug, Clone, Default)]
pub struct MockPage {
    pub title: String,
    pub content: String,
}

impl MockPage {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
        }
    }
}

/// Mock Agent：goto 只切换当前 URL，title/content 查内存表
pub struct MockAgent {
    id: String,
    pages: Arc<HashMap<String, MockPage>>,
    evaluations: Arc<HashMap<String, Value>>,
    current: Mutex<Option<String>>,
}

impl MockAgent {
    fn current_page(&self) -> Option<MockPage> {
        let current = self.current.lock();
        current.as_ref().and_then(|url| self.pages.get(url).cloned())
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn goto(&self, url: &str) -> Result<(), AgentError> {
        if !self.pages.contains_key(url) {
            return Err(AgentError::Navigation(format!("no page registered for {url}")));
        }
        *self.current.lock() = Some(url.to_string());
        Ok(())
    }

    async fn url(&self) -> Result<String, AgentError> {
        Ok(self
            .current
            .lock()
            .clone()
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn title(&self) -> Result<String, AgentError> {
        Ok(self.current_page().map(|p| p.title).unwrap_or_default())
    }

    async fn content(&self) -> Result<String, AgentError> {
        Ok(self.current_page().map(|p| p.content).unwrap_or_default())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, AgentError> {
        self.evaluations
            .get(expression)
            .cloned()
            .ok_or_else(|| AgentError::Evaluation(format!("unsupported expression: {expression}")))
    }
}

/// Mock Provider：计数 + 可选延迟/失败
#[derive(Default)]
pub struct MockAgentProvider {
    pages: Arc<HashMap<String, MockPage>>,
    evaluations: Arc<HashMap<String, Value>>,
    acquire_delay: Option<Duration>,
    fail_acquire: bool,
    acquired: AtomicUsize,
    released: AtomicUsize,
    configs: Mutex<Vec<AgentConfig>>,
}

impl MockAgentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, page: MockPage) -> Self {
        Arc::make_mut(&mut self.pages).insert(url.into(), page);
        self
    }

    pub fn with_evaluation(mut self, expression: impl Into<String>, value: Value) -> Self {
        Arc::make_mut(&mut self.evaluations).insert(expression.into(), value);
        self
    }

    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = Some(delay);
        self
    }

    /// 每次 acquire 都返回 Launch 错误
    pub fn failing(mut self) -> Self {
        self.fail_acquire = true;
        self
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// 历次 acquire 收到的配置（按调用顺序）
    pub fn configs(&self) -> Vec<AgentConfig> {
        self.configs.lock().clone()
    }
}

#[async_trait]
impl AgentProvider for MockAgentProvider {
    async fn acquire(&self, config: &AgentConfig) -> Result<Arc<dyn Agent>, AgentError> {
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().push(config.clone());
        if let Some(delay) = self.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_acquire {
            return Err(AgentError::Launch("mock provider configured to fail".to_string()));
        }
        Ok(Arc::new(MockAgent {
            id: format!("mock-{n}"),
            pages: Arc::clone(&self.pages),
            evaluations: Arc::clone(&self.evaluations),
            current: Mutex::new(None),
        }))
    }

    async fn release(&self, agent: Arc<dyn Agent>) -> Result<(), AgentError> {
        tracing::debug!(agent = %agent.id(), "mock agent released");
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
