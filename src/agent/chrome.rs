//! Chrome Agent：每个 Agent 一个 Headless Chrome 进程 + 一个标签页
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! 代理在启动参数中指定；资源拦截通过 Network.setBlockedURLs 映射为 URL 通配模式。
//! headless_chrome 为同步 API，所有调用都包在 spawn_blocking 中。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Network;
use headless_chrome::{Browser, LaunchOptions, Tab};
use parking_lot::Mutex;
use serde_json::Value;

use crate::agent::{blocked_url_patterns, Agent, AgentConfig, AgentError, AgentProvider};

/// 单个浏览器 Agent
pub struct ChromeAgent {
    id: String,
    // 持有 Browser 以保持进程存活；drop 时关闭
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeAgent {
    async fn with_tab<T, F>(&self, f: F) -> Result<T, AgentError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T, AgentError> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| AgentError::Evaluation(format!("Task join: {e}")))?
    }
}

#[async_trait]
impl Agent for ChromeAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn goto(&self, url: &str) -> Result<(), AgentError> {
        let url = url.to_string();
        tracing::info!(agent = %self.id, url = %url, "chrome agent navigate");
        self.with_tab(move |tab| {
            tab.navigate_to(&url)
                .map_err(|e| AgentError::Navigation(e.to_string()))?;
            tab.wait_until_navigated()
                .map_err(|e| AgentError::Navigation(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn url(&self) -> Result<String, AgentError> {
        self.with_tab(|tab| Ok(tab.get_url())).await
    }

    async fn title(&self) -> Result<String, AgentError> {
        self.with_tab(|tab| {
            tab.get_title()
                .map_err(|e| AgentError::Evaluation(format!("Get title failed: {e}")))
        })
        .await
    }

    async fn content(&self) -> Result<String, AgentError> {
        let html = self
            .with_tab(|tab| {
                tab.get_content()
                    .map_err(|e| AgentError::Evaluation(format!("Get content failed: {e}")))
            })
            .await?;
        Ok(html2text::from_read(html.as_bytes(), 120).unwrap_or(html))
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, AgentError> {
        let js = expression.to_string();
        self.with_tab(move |tab| {
            let remote = tab
                .evaluate(&js, true)
                .map_err(|e| AgentError::Evaluation(e.to_string()))?;
            Ok(remote.value.unwrap_or(Value::Null))
        })
        .await
    }
}

/// 按需启动 Chrome 的 Provider；release 时关闭对应进程
pub struct ChromeAgentProvider {
    headless: bool,
    agents: Mutex<HashMap<String, Arc<ChromeAgent>>>,
}

impl ChromeAgentProvider {
    pub fn new(headless: bool) -> Self {
        Self {
            headless,
            agents: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AgentProvider for ChromeAgentProvider {
    async fn acquire(&self, config: &AgentConfig) -> Result<Arc<dyn Agent>, AgentError> {
        let headless = self.headless;
        let proxy = config.proxy_url.clone();
        let patterns = blocked_url_patterns(&config.blocked_resource_types);
        let id = format!("chrome_{}", uuid::Uuid::new_v4());

        let agent_id = id.clone();
        let agent = tokio::task::spawn_blocking(move || {
            let options = LaunchOptions::default_builder()
                .headless(headless)
                .proxy_server(proxy.as_deref())
                .build()
                .map_err(|e| AgentError::Launch(e.to_string()))?;
            let browser = Browser::new(options)
                .map_err(|e| AgentError::Launch(format!("Chrome launch failed: {e}")))?;
            let tab = browser
                .new_tab()
                .map_err(|e| AgentError::Launch(format!("Browser tab failed: {e}")))?;
            if !patterns.is_empty() {
                if let Err(e) = tab.call_method(Network::SetBlockedURLs { urls: patterns }) {
                    tracing::warn!(error = %e, "failed to apply blocked resource types");
                }
            }
            Ok::<_, AgentError>(ChromeAgent {
                id: agent_id,
                _browser: browser,
                tab,
            })
        })
        .await
        .map_err(|e| AgentError::Launch(format!("Task join: {e}")))??;

        let agent = Arc::new(agent);
        self.agents.lock().insert(id, Arc::clone(&agent));
        Ok(agent)
    }

    async fn release(&self, agent: Arc<dyn Agent>) -> Result<(), AgentError> {
        let owned = self.agents.lock().remove(agent.id());
        drop(agent);
        let Some(owned) = owned else {
            return Err(AgentError::Release("agent not owned by this provider".to_string()));
        };
        tokio::task::spawn_blocking(move || {
            if let Err(e) = owned.tab.close(true) {
                tracing::warn!(agent = %owned.id, "Chrome tab close failed: {}", e);
            }
            drop(owned);
        })
        .await
        .map_err(|e| AgentError::Release(format!("Task join: {e}")))
    }
}
