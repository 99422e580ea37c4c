//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SCHEDULER__MAX_CONCURRENCY=4`）。
//! `HIVE__SCHEDULER__BLOCKED_RESOURCE_TYPES` 可写成逗号分隔列表。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub agent: AgentSection,
}

/// [server] 段：HTTP 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// [scheduler] 段：并发上限、超时（毫秒）、默认 Agent 策略
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    pub upstream_proxy_url: Option<String>,
    /// 如 image、stylesheet、font、media
    #[serde(default)]
    pub blocked_resource_types: Vec<String>,
}

fn default_max_concurrency() -> usize {
    10
}

fn default_session_timeout_ms() -> u64 {
    60_000
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            session_timeout_ms: default_session_timeout_ms(),
            queue_timeout_ms: default_queue_timeout_ms(),
            upstream_proxy_url: None,
            blocked_resource_types: Vec::new(),
        }
    }
}

/// [agent] 段：Provider 选择
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// mock / chrome
    #[serde(default = "default_agent_provider")]
    pub provider: String,
    #[serde(default = "default_headless")]
    pub headless: bool,
}

fn default_agent_provider() -> String {
    if cfg!(feature = "browser") {
        "chrome".to_string()
    } else {
        "mock".to_string()
    }
}

fn default_headless() -> bool {
    true
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            provider: default_agent_provider(),
            headless: default_headless(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {} not found, ignoring", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("scheduler.blocked_resource_types")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
