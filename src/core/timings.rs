//! 任务计时：创建 / 开始 / 结束时间（毫秒时间戳）与派生耗时

use serde::Serialize;

/// 单个任务的时间线；start / end 只记录第一次调用
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    pub created: i64,
    pub started: Option<i64>,
    pub ended: Option<i64>,
    /// 排队耗时（created → started）
    pub queued_ms: Option<i64>,
    /// 执行耗时（started → ended）
    pub running_ms: Option<i64>,
    /// 总耗时（created → ended）
    pub total_ms: Option<i64>,
}

impl Default for Timings {
    fn default() -> Self {
        Self::new()
    }
}

impl Timings {
    pub fn new() -> Self {
        Self::created_at(now_millis())
    }

    fn created_at(created: i64) -> Self {
        Self {
            created,
            started: None,
            ended: None,
            queued_ms: None,
            running_ms: None,
            total_ms: None,
        }
    }

    pub fn start(&mut self) {
        self.start_at(now_millis());
    }

    pub fn end(&mut self) {
        self.end_at(now_millis());
    }

    fn start_at(&mut self, at: i64) {
        if self.started.is_some() {
            return;
        }
        self.started = Some(at);
        self.queued_ms = Some((at - self.created).max(0));
    }

    /// 未开始就结束（如排队超时）时，running_ms 保持为空
    fn end_at(&mut self, at: i64) {
        if self.ended.is_some() {
            return;
        }
        self.ended = Some(at);
        self.running_ms = self.started.map(|s| (at - s).max(0));
        self.total_ms = Some((at - self.created).max(0));
    }

    pub fn is_started(&self) -> bool {
        self.started.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_some()
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
