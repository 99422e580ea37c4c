//! Hive - 脚本任务池服务
//!
//! 模块划分：
//! - **agent**: Agent 与 Provider 抽象（Mock / 无头 Chrome）
//! - **api**: 请求校验与提交（BAD_ARGS 在此拦截）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务、计时、调度器、错误、优雅关闭
//! - **observability**: tracing 订阅器
//! - **script**: 可插拔脚本引擎与内置 DSL 解释器

pub mod agent;
pub mod api;
pub mod config;
pub mod core;
pub mod observability;
pub mod script;
