//! 调度器：有界执行池 + FIFO 等待队列 + 排队/会话超时 + 终态计数
//!
//! 所有状态变更由一把 `parking_lot::Mutex` 串行化，锁不跨 await，也从不在持锁时调用
//! `Task::fulfill`（回调可能重入调度器）。
//!
//! 每个运行中的任务由一个 driver 协程负责：获取 Agent → 派生执行步骤 → 与会话超时/关闭信号竞争
//! → 释放 Agent → 腾出槽位并推进队列。执行步骤单独 spawn，强制超时无需等待脚本即可回收槽位。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentConfig, AgentError, AgentProvider};
use crate::config::SchedulerSection;
use crate::core::error::{HiveError, TaskError};
use crate::core::task::{Task, TaskCallback, TaskId, TaskReport, TaskStatus};
use crate::script::ScriptEngine;

/// 释放 Agent 的等待上限
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);
/// close() 等待运行中任务收尾的上限
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// 调度器配置；构造后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub session_timeout: Duration,
    pub queue_timeout: Duration,
    pub upstream_proxy_url: Option<String>,
    pub blocked_resource_types: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SchedulerSection::default())
    }
}

impl From<&SchedulerSection> for SchedulerConfig {
    fn from(section: &SchedulerSection) -> Self {
        Self {
            max_concurrency: section.max_concurrency,
            session_timeout: Duration::from_millis(section.session_timeout_ms),
            queue_timeout: Duration::from_millis(section.queue_timeout_ms),
            upstream_proxy_url: section.upstream_proxy_url.clone(),
            blocked_resource_types: section.blocked_resource_types.clone(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), HiveError> {
        if self.max_concurrency == 0 {
            return Err(HiveError::InvalidConfig(
                "max_concurrency must be greater than 0".into(),
            ));
        }
        if self.session_timeout.is_zero() {
            return Err(HiveError::InvalidConfig(
                "session_timeout must be greater than 0".into(),
            ));
        }
        if self.queue_timeout.is_zero() {
            return Err(HiveError::InvalidConfig(
                "queue_timeout must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    fn agent_defaults(&self) -> AgentConfig {
        AgentConfig {
            proxy_url: self.upstream_proxy_url.clone(),
            blocked_resource_types: self.blocked_resource_types.clone(),
        }
    }
}

/// 超时配置快照（毫秒）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeoutStats {
    pub session: u64,
    pub queue: u64,
}

/// 只读统计快照，/stats 的 `task` 字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub timeout: TimeoutStats,
    pub concurrency: usize,
    pub pool: usize,
    pub queue: usize,
    /// 各终态计数，外加 `total`
    pub counter: BTreeMap<String, u64>,
}

struct PoolSlot {
    task: Arc<Task>,
    driver: Option<JoinHandle<()>>,
}

struct QueuedTask {
    task: Arc<Task>,
    timer: AbortHandle,
}

struct SchedulerState {
    pool: HashMap<TaskId, PoolSlot>,
    queue: VecDeque<QueuedTask>,
    counter: BTreeMap<TaskStatus, u64>,
    closed: bool,
}

struct Inner {
    config: SchedulerConfig,
    agent_defaults: AgentConfig,
    provider: Arc<dyn AgentProvider>,
    engine: Arc<dyn ScriptEngine>,
    runtime: Handle,
    shutdown: CancellationToken,
    state: Mutex<SchedulerState>,
}

/// 任务调度器；Clone 共享同一个池
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// 创建调度器；必须在 tokio 运行时内调用
    pub fn new(
        config: SchedulerConfig,
        provider: Arc<dyn AgentProvider>,
        engine: Arc<dyn ScriptEngine>,
    ) -> Result<Self, HiveError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| HiveError::NoRuntime(e.to_string()))?;

        let counter = [TaskStatus::Done, TaskStatus::Failed, TaskStatus::TimedOut]
            .into_iter()
            .map(|s| (s, 0))
            .collect();

        tracing::info!(
            max_concurrency = config.max_concurrency,
            session_timeout_ms = config.session_timeout.as_millis() as u64,
            queue_timeout_ms = config.queue_timeout.as_millis() as u64,
            "Scheduler created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                agent_defaults: config.agent_defaults(),
                config,
                provider,
                engine,
                runtime,
                shutdown: CancellationToken::new(),
                state: Mutex::new(SchedulerState {
                    pool: HashMap::new(),
                    queue: VecDeque::new(),
                    counter,
                    closed: false,
                }),
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// 提交任务；立即返回，结果只经回调送达
    ///
    /// 仅当任务已提交过或已完成时返回错误。
    pub fn process<F>(&self, task: Arc<Task>, callback: F) -> Result<(), HiveError>
    where
        F: FnOnce(TaskReport) + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let wrapped: TaskCallback = Box::new(move |report: TaskReport| {
            if let Some(inner) = weak.upgrade() {
                inner.record(report.status);
            }
            callback(report);
        });
        task.attach(wrapped)?;
        self.inner.submit(task);
        Ok(())
    }

    pub fn pool_length(&self) -> usize {
        self.inner.state.lock().pool.len()
    }

    pub fn queue_length(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn counter(&self) -> BTreeMap<TaskStatus, u64> {
        self.inner.state.lock().counter.clone()
    }

    pub fn counter_total(&self) -> u64 {
        self.inner.state.lock().counter.values().sum()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        let mut counter: BTreeMap<String, u64> = state
            .counter
            .iter()
            .map(|(status, n)| (status.as_str().to_string(), *n))
            .collect();
        counter.insert("total".to_string(), state.counter.values().sum());
        SchedulerStats {
            timeout: TimeoutStats {
                session: self.inner.config.session_timeout.as_millis() as u64,
                queue: self.inner.config.queue_timeout.as_millis() as u64,
            },
            concurrency: self.inner.config.max_concurrency,
            pool: state.pool.len(),
            queue: state.queue.len(),
            counter,
        }
    }

    /// 关闭：停止接纳，排队任务以 "Scheduler closed" 失败，运行中任务被强制结束并等待释放 Agent
    pub async fn close(&self) {
        let (queued, drivers) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                tracing::debug!("Scheduler already closed");
                return;
            }
            state.closed = true;
            let queued: Vec<Arc<Task>> = state
                .queue
                .drain(..)
                .map(|q| {
                    q.timer.abort();
                    q.task
                })
                .collect();
            let drivers: Vec<JoinHandle<()>> = state
                .pool
                .values_mut()
                .filter_map(|slot| {
                    tracing::debug!(task = %slot.task.id(), "Stopping running task");
                    slot.driver.take()
                })
                .collect();
            (queued, drivers)
        };

        tracing::info!(
            queued = queued.len(),
            running = drivers.len(),
            "Closing scheduler"
        );
        self.inner.shutdown.cancel();

        for task in queued {
            task.fulfill(
                TaskStatus::Failed,
                Value::Null,
                Some(TaskError::SchedulerClosed.to_string()),
                None,
            );
        }

        if tokio::time::timeout(CLOSE_TIMEOUT, futures_util::future::join_all(drivers))
            .await
            .is_err()
        {
            tracing::warn!(
                "Scheduler close timed out after {}s waiting for running tasks",
                CLOSE_TIMEOUT.as_secs()
            );
        }
        tracing::info!("Scheduler closed");
    }
}

impl Inner {
    fn record(&self, status: TaskStatus) {
        *self.state.lock().counter.entry(status).or_insert(0) += 1;
    }

    fn submit(self: &Arc<Self>, task: Arc<Task>) {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            tracing::warn!(task = %task.id(), "Scheduler closed, rejecting task");
            task.fulfill(
                TaskStatus::Failed,
                Value::Null,
                Some(TaskError::SchedulerClosed.to_string()),
                None,
            );
            return;
        }

        if state.pool.len() < self.config.max_concurrency && state.queue.is_empty() {
            self.admit_locked(&mut state, task);
            return;
        }

        let timeout = task
            .options()
            .queue_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.queue_timeout);
        let timer = self
            .runtime
            .spawn(queue_timer(
                Arc::downgrade(self),
                task.id().to_string(),
                timeout,
                self.shutdown.clone(),
            ))
            .abort_handle();
        tracing::debug!(
            task = %task.id(),
            position = state.queue.len() + 1,
            "Pool full, task queued"
        );
        state.queue.push_back(QueuedTask { task, timer });
    }

    /// 入池并启动 driver；调用方持有状态锁
    fn admit_locked(self: &Arc<Self>, state: &mut SchedulerState, task: Arc<Task>) {
        task.mark_started();
        tracing::info!(
            task = %task.id(),
            pool = state.pool.len() + 1,
            script_bytes = task.script().len(),
            "Task admitted"
        );
        let driver = self
            .runtime
            .spawn(Arc::clone(self).drive(Arc::clone(&task)));
        state.pool.insert(
            task.id().to_string(),
            PoolSlot {
                task,
                driver: Some(driver),
            },
        );
    }

    fn on_queue_timeout(&self, id: &str, timeout: Duration) {
        let task = {
            let mut state = self.state.lock();
            let position = state.queue.iter().position(|q| q.task.id() == id);
            position
                .and_then(|p| state.queue.remove(p))
                .map(|q| q.task)
        };
        if let Some(task) = task {
            let ms = timeout.as_millis() as u64;
            tracing::warn!(task = %id, timeout_ms = ms, "Task timed out in queue");
            task.fulfill(
                TaskStatus::TimedOut,
                Value::Null,
                Some(TaskError::QueueTimeout(ms).to_string()),
                None,
            );
        }
    }

    async fn drive(self: Arc<Self>, task: Arc<Task>) {
        let session_timeout = task
            .options()
            .session_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.session_timeout);
        let deadline = tokio::time::sleep(session_timeout);
        tokio::pin!(deadline);

        if let Some(agent) = self
            .acquire_agent(&task, deadline.as_mut(), session_timeout)
            .await
        {
            self.execute(&task, agent, deadline.as_mut(), session_timeout)
                .await;
        }
        self.finish(task.id());
    }

    /// 获取 Agent；失败或超时时任务已被 fulfill，返回 None
    async fn acquire_agent(
        &self,
        task: &Task,
        deadline: Pin<&mut Sleep>,
        session_timeout: Duration,
    ) -> Option<Arc<dyn Agent>> {
        let provider = Arc::clone(&self.provider);
        let config = task.options().agent_config(&self.agent_defaults);
        let mut acquire = self
            .runtime
            .spawn(async move { provider.acquire(&config).await });

        let outcome = tokio::select! {
            joined = &mut acquire => Some(joined),
            _ = deadline => None,
            _ = self.shutdown.cancelled() => None,
        };

        let reason = match outcome {
            Some(Ok(Ok(agent))) => {
                tracing::debug!(task = %task.id(), agent = %agent.id(), "Agent acquired");
                return Some(agent);
            }
            Some(Ok(Err(e))) => TaskError::AgentUnavailable(e.to_string()),
            Some(Err(e)) => TaskError::AgentUnavailable(e.to_string()),
            None => {
                // 获取仍在进行：拿到后在后台归还
                self.release_when_acquired(acquire);
                if self.shutdown.is_cancelled() {
                    TaskError::SchedulerClosed
                } else {
                    TaskError::SessionTimeout(session_timeout.as_millis() as u64)
                }
            }
        };

        tracing::warn!(task = %task.id(), "Task failed before execution: {}", reason);
        task.fulfill(
            TaskStatus::Failed,
            Value::Null,
            Some(reason.to_string()),
            None,
        );
        None
    }

    async fn execute(
        &self,
        task: &Arc<Task>,
        agent: Arc<dyn Agent>,
        deadline: Pin<&mut Sleep>,
        session_timeout: Duration,
    ) {
        let mut execution = {
            let task = Arc::clone(task);
            let agent = Arc::clone(&agent);
            let engine = Arc::clone(&self.engine);
            self.runtime
                .spawn(async move { task.run(agent, engine).await })
        };

        let forced = tokio::select! {
            joined = &mut execution => match joined {
                Ok(_) => None,
                Err(e) => Some(TaskError::ExecutionAborted(e.to_string())),
            },
            _ = deadline => Some(TaskError::SessionTimeout(session_timeout.as_millis() as u64)),
            _ = self.shutdown.cancelled() => Some(TaskError::SchedulerClosed),
        };

        let Some(reason) = forced else {
            tracing::info!(task = %task.id(), status = %task.status(), "Task settled");
            release_agent(Arc::clone(&self.provider), agent).await;
            return;
        };

        if task.fulfill(
            TaskStatus::Failed,
            Value::Null,
            Some(reason.to_string()),
            None,
        ) {
            tracing::warn!(task = %task.id(), "Task forced to settle: {}", reason);
        }

        if reason == TaskError::SchedulerClosed {
            release_agent(Arc::clone(&self.provider), agent).await;
        } else {
            self.runtime
                .spawn(release_agent(Arc::clone(&self.provider), agent));
        }
    }

    fn release_when_acquired(
        &self,
        acquire: JoinHandle<Result<Arc<dyn Agent>, AgentError>>,
    ) {
        let provider = Arc::clone(&self.provider);
        self.runtime.spawn(async move {
            if let Ok(Ok(agent)) = acquire.await {
                release_agent(provider, agent).await;
            }
        });
    }

    /// 腾出槽位并按 FIFO 接纳队首任务
    fn finish(self: &Arc<Self>, id: &str) {
        let mut state = self.state.lock();
        state.pool.remove(id);
        if state.closed {
            return;
        }
        while state.pool.len() < self.config.max_concurrency {
            let Some(next) = state.queue.pop_front() else {
                break;
            };
            next.timer.abort();
            if next.task.is_fulfilled() {
                continue;
            }
            self.admit_locked(&mut state, next.task);
        }
    }
}

async fn queue_timer(
    inner: Weak<Inner>,
    id: TaskId,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    tokio::select! {
        _ = tokio::time::sleep(timeout) => {}
        _ = shutdown.cancelled() => return,
    }
    if let Some(inner) = inner.upgrade() {
        inner.on_queue_timeout(&id, timeout);
    }
}

async fn release_agent(provider: Arc<dyn AgentProvider>, agent: Arc<dyn Agent>) {
    let id = agent.id().to_string();
    match tokio::time::timeout(RELEASE_TIMEOUT, provider.release(agent)).await {
        Ok(Ok(())) => tracing::debug!(agent = %id, "Agent released"),
        Ok(Err(e)) => tracing::warn!(agent = %id, "Agent release failed: {}", e),
        Err(_) => tracing::warn!(
            agent = %id,
            "Agent release timed out after {}s",
            RELEASE_TIMEOUT.as_secs()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgentProvider;
    use crate::script::Interpreter;

    fn scheduler(config: SchedulerConfig) -> Result<Scheduler, HiveError> {
        Scheduler::new(
            config,
            Arc::new(MockAgentProvider::new()),
            Arc::new(Interpreter::new()),
        )
    }

    #[test]
    fn test_default_config_matches_section_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.session_timeout, Duration::from_millis(60_000));
        assert_eq!(config.queue_timeout, Duration::from_millis(30_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = SchedulerConfig {
            max_concurrency: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(config.validate(), Err(HiveError::InvalidConfig(_))));

        let config = SchedulerConfig {
            queue_timeout: Duration::ZERO,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_new_without_runtime_fails() {
        assert!(matches!(
            scheduler(SchedulerConfig::default()),
            Err(HiveError::NoRuntime(_))
        ));
    }

    #[tokio::test]
    async fn test_fresh_stats() {
        let s = scheduler(SchedulerConfig {
            max_concurrency: 3,
            ..SchedulerConfig::default()
        })
        .unwrap();
        let stats = s.stats();
        assert_eq!(stats.concurrency, 3);
        assert_eq!(stats.pool, 0);
        assert_eq!(stats.queue, 0);
        assert_eq!(stats.timeout.session, 60_000);
        assert_eq!(stats.counter.get("total"), Some(&0));
        assert_eq!(stats.counter.get("DONE"), Some(&0));
        assert_eq!(s.counter_total(), 0);
    }

    #[tokio::test]
    async fn test_process_twice_is_rejected() {
        let s = scheduler(SchedulerConfig::default()).unwrap();
        let task = Arc::new(Task::new("resolve(1)", Default::default(), Value::Null));
        s.process(Arc::clone(&task), |_| {}).unwrap();
        assert!(matches!(
            s.process(task, |_| {}),
            Err(HiveError::AlreadySubmitted(_))
        ));
    }

    #[tokio::test]
    async fn test_stats_serialization_shape() {
        let s = scheduler(SchedulerConfig::default()).unwrap();
        let json = serde_json::to_value(s.stats()).unwrap();
        assert!(json["timeout"]["queue"].is_u64());
        assert!(json["counter"]["TIMED_OUT"].is_u64());
    }
}
