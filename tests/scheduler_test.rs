//! 调度器集成测试：并发上限、FIFO、排队/会话超时、计数、关闭

use std::sync::Arc;
use std::time::Duration;

use hive::agent::MockAgentProvider;
use hive::core::scheduler::{Scheduler, SchedulerConfig};
use hive::core::task::{Task, TaskOptions, TaskReport, TaskStatus};
use hive::script::Interpreter;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

fn config(max_concurrency: usize, session_ms: u64, queue_ms: u64) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrency,
        session_timeout: Duration::from_millis(session_ms),
        queue_timeout: Duration::from_millis(queue_ms),
        ..SchedulerConfig::default()
    }
}

fn setup(config: SchedulerConfig, provider: MockAgentProvider) -> (Scheduler, Arc<MockAgentProvider>) {
    let provider = Arc::new(provider);
    let scheduler = Scheduler::new(config, provider.clone(), Arc::new(Interpreter::new())).unwrap();
    (scheduler, provider)
}

fn submit(scheduler: &Scheduler, script: &str) -> oneshot::Receiver<TaskReport> {
    submit_with(scheduler, script, TaskOptions::default())
}

fn submit_with(
    scheduler: &Scheduler,
    script: &str,
    options: TaskOptions,
) -> oneshot::Receiver<TaskReport> {
    let (tx, rx) = oneshot::channel();
    scheduler
        .process(Arc::new(Task::new(script, options, Value::Null)), move |report| {
            let _ = tx.send(report);
        })
        .unwrap();
    rx
}

async fn settle(rx: oneshot::Receiver<TaskReport>) -> TaskReport {
    timeout(Duration::from_secs(5), rx)
        .await
        .expect("task did not settle in time")
        .expect("callback dropped")
}

#[tokio::test]
async fn test_pool_is_bounded_and_overflow_queues() {
    let (scheduler, _) = setup(config(2, 5_000, 5_000), MockAgentProvider::new());
    let receivers: Vec<_> = (0..3)
        .map(|_| submit(&scheduler, "sleep(100); resolve('ok')"))
        .collect();

    assert_eq!(scheduler.pool_length(), 2);
    assert_eq!(scheduler.queue_length(), 1);

    for rx in receivers {
        let report = settle(rx).await;
        assert_eq!(report.status, TaskStatus::Done);
        assert_eq!(report.output, json!("ok"));
    }
    assert_eq!(scheduler.counter_total(), 3);
    assert_eq!(scheduler.queue_length(), 0);
}

#[tokio::test]
async fn test_fifo_admission_order() {
    let (scheduler, _) = setup(config(1, 5_000, 5_000), MockAgentProvider::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    for i in 0..4 {
        let tx = tx.clone();
        scheduler
            .process(
                Arc::new(Task::new(
                    format!("sleep(10); resolve({i})"),
                    TaskOptions::default(),
                    Value::Null,
                )),
                move |report| {
                    let _ = tx.send(report.output);
                },
            )
            .unwrap();
    }
    drop(tx);

    let mut order = Vec::new();
    while let Some(output) = timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
        order.push(output);
    }
    assert_eq!(order, vec![json!(0), json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn test_queue_timeout_never_acquires_agent() {
    let (scheduler, provider) = setup(config(1, 5_000, 50), MockAgentProvider::new());
    let running = submit(&scheduler, "sleep(300); resolve(1)");
    let waiting = submit(&scheduler, "resolve(2)");

    let report = settle(waiting).await;
    assert_eq!(report.status, TaskStatus::TimedOut);
    assert!(report.error.unwrap().contains("Queue timeout"));
    assert_eq!(report.output, Value::Null);
    assert!(report.timings.unwrap().started.is_none());
    assert_eq!(scheduler.queue_length(), 0);
    assert_eq!(provider.acquired(), 1);

    assert_eq!(settle(running).await.status, TaskStatus::Done);
    assert_eq!(provider.acquired(), 1);
    assert_eq!(scheduler.counter()[&TaskStatus::TimedOut], 1);
}

#[tokio::test]
async fn test_per_task_queue_timeout_override() {
    let (scheduler, _) = setup(config(1, 5_000, 10_000), MockAgentProvider::new());
    let running = submit(&scheduler, "sleep(300); resolve(1)");
    let waiting = submit_with(
        &scheduler,
        "resolve(2)",
        TaskOptions {
            queue_timeout_ms: Some(30),
            ..TaskOptions::default()
        },
    );

    assert_eq!(settle(waiting).await.status, TaskStatus::TimedOut);
    assert_eq!(settle(running).await.status, TaskStatus::Done);
}

#[tokio::test]
async fn test_session_timeout_frees_slot() {
    let (scheduler, provider) = setup(config(1, 100, 5_000), MockAgentProvider::new());
    let stuck = submit(&scheduler, "sleep(10000)");
    let next = submit(&scheduler, "resolve('next')");

    let report = settle(stuck).await;
    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report.error.unwrap().contains("Session timeout"));

    let report = timeout(Duration::from_secs(2), next)
        .await
        .expect("queued task should be admitted promptly")
        .unwrap();
    assert_eq!(report.status, TaskStatus::Done);
    assert_eq!(report.output, json!("next"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(provider.released(), 2);
    assert_eq!(scheduler.pool_length(), 0);
}

#[tokio::test]
async fn test_per_task_session_timeout_override() {
    let (scheduler, _) = setup(config(2, 60_000, 5_000), MockAgentProvider::new());
    let rx = submit_with(
        &scheduler,
        "sleep(10000)",
        TaskOptions {
            session_timeout_ms: Some(50),
            ..TaskOptions::default()
        },
    );
    let report = settle(rx).await;
    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report.error.unwrap().contains("50ms"));
}

#[tokio::test]
async fn test_session_timeout_covers_agent_acquisition() {
    let provider = MockAgentProvider::new().with_acquire_delay(Duration::from_millis(500));
    let (scheduler, provider) = setup(config(1, 50, 5_000), provider);
    let report = settle(submit(&scheduler, "resolve(1)")).await;
    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report.error.unwrap().contains("Session timeout"));

    // 迟到的 Agent 在后台归还
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(provider.released(), 1);
}

#[tokio::test]
async fn test_counters_track_outcomes() {
    let (scheduler, _) = setup(config(3, 5_000, 5_000), MockAgentProvider::new());
    let done = submit(&scheduler, "resolve(1 + 1)");
    let thrown = submit(&scheduler, "throw \"x\"");
    let rejected = submit(&scheduler, "reject({reason: 'nope'})");

    let done = settle(done).await;
    assert_eq!(done.status, TaskStatus::Done);
    assert_eq!(done.output, json!(2));
    assert_eq!(done.error, None);

    let thrown = settle(thrown).await;
    assert_eq!(thrown.status, TaskStatus::Failed);
    assert!(thrown.error.unwrap().contains('x'));

    let rejected = settle(rejected).await;
    assert_eq!(rejected.status, TaskStatus::Failed);
    assert!(rejected.error.unwrap().contains("nope"));

    let counter = scheduler.counter();
    assert_eq!(counter[&TaskStatus::Done], 1);
    assert_eq!(counter[&TaskStatus::Failed], 2);
    assert_eq!(counter[&TaskStatus::TimedOut], 0);
    assert_eq!(scheduler.counter_total(), counter.values().sum::<u64>());
    assert_eq!(scheduler.stats().counter["total"], 3);
}

#[tokio::test]
async fn test_acquire_failure_fails_task_and_advances_queue() {
    let (scheduler, provider) = setup(config(1, 5_000, 5_000), MockAgentProvider::new().failing());
    let first = submit(&scheduler, "resolve(1)");
    let second = submit(&scheduler, "resolve(2)");

    for rx in [first, second] {
        let report = settle(rx).await;
        assert_eq!(report.status, TaskStatus::Failed);
        assert!(report.error.unwrap().contains("Agent unavailable"));
    }
    assert_eq!(provider.acquired(), 2);
    assert_eq!(provider.released(), 0);
    assert_eq!(scheduler.pool_length(), 0);
}

#[tokio::test]
async fn test_agent_config_merges_task_overrides() {
    let mut cfg = config(1, 5_000, 5_000);
    cfg.upstream_proxy_url = Some("http://proxy:3128".into());
    cfg.blocked_resource_types = vec!["image".into()];
    let (scheduler, provider) = setup(cfg, MockAgentProvider::new());

    let options: TaskOptions =
        serde_json::from_value(json!({"blockedResourceTypes": ["font", "media"]})).unwrap();
    settle(submit_with(&scheduler, "resolve(1)", options)).await;

    let seen = provider.configs();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].proxy_url.as_deref(), Some("http://proxy:3128"));
    assert_eq!(seen[0].blocked_resource_types, vec!["font".to_string(), "media".to_string()]);
}

#[tokio::test]
async fn test_script_sees_agent_pages() {
    let provider = MockAgentProvider::new().with_page(
        "https://example.com",
        hive::agent::MockPage::new("Example Domain", "<h1>Example</h1>"),
    );
    let (scheduler, _) = setup(config(1, 5_000, 5_000), provider);
    let report = settle(submit(
        &scheduler,
        "await agent.goto('https://example.com')\nresolve({title: await agent.title(), url: await agent.url()})",
    ))
    .await;
    assert_eq!(report.status, TaskStatus::Done);
    assert_eq!(
        report.output,
        json!({"title": "Example Domain", "url": "https://example.com"})
    );
}

#[tokio::test]
async fn test_callback_can_reenter_scheduler() {
    let (scheduler, _) = setup(config(1, 5_000, 5_000), MockAgentProvider::new());
    let (tx, rx) = oneshot::channel();
    let observer = scheduler.clone();
    scheduler
        .process(
            Arc::new(Task::new("resolve(1)", TaskOptions::default(), Value::Null)),
            move |report| {
                let _ = tx.send((report.status, observer.stats().counter["total"]));
            },
        )
        .unwrap();
    let (status, total) = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(status, TaskStatus::Done);
    assert_eq!(total, 1);
}

#[tokio::test]
async fn test_close_fails_queued_and_running_tasks() {
    let (scheduler, provider) = setup(config(1, 60_000, 60_000), MockAgentProvider::new());
    let running = submit(&scheduler, "sleep(10000); resolve(1)");
    let queued = submit(&scheduler, "resolve(2)");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(provider.acquired(), 1);

    timeout(Duration::from_secs(5), scheduler.close())
        .await
        .expect("close should not hang");

    for rx in [running, queued] {
        let report = settle(rx).await;
        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("Scheduler closed"));
    }
    assert_eq!(provider.released(), 1);
    assert_eq!(scheduler.pool_length(), 0);
    assert_eq!(scheduler.queue_length(), 0);

    let late = settle(submit(&scheduler, "resolve(3)")).await;
    assert_eq!(late.status, TaskStatus::Failed);
    assert_eq!(provider.acquired(), 1);
}

#[tokio::test]
async fn test_done_report_has_timings_and_profile() {
    let (scheduler, _) = setup(config(1, 5_000, 5_000), MockAgentProvider::new());
    let (tx, rx) = oneshot::channel();
    scheduler
        .process(
            Arc::new(Task::new(
                "setProfile({visits: profile.visits + 1}); resolve(null)",
                TaskOptions::default(),
                json!({"visits": 1}),
            )),
            move |report| {
                let _ = tx.send(report);
            },
        )
        .unwrap();
    let report = settle(rx).await;
    assert_eq!(report.status, TaskStatus::Done);
    assert_eq!(report.profile, Some(json!({"visits": 2})));
    let timings = report.timings.unwrap();
    assert!(timings.started.is_some());
    assert!(timings.ended.is_some());
    assert!(timings.total_ms.unwrap() >= 0);
}

#[tokio::test]
async fn test_runaway_scripts_fail_without_taking_down_the_pool() {
    let (scheduler, _) = setup(config(2, 10_000, 10_000), MockAgentProvider::new());

    let deep = format!("resolve({}1{})", "(".repeat(10_000), ")".repeat(10_000));
    let report = settle(submit(&scheduler, &deep)).await;
    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report.error.unwrap().contains("nesting too deep"));

    let doubling = format!("let s = 'x'\n{}resolve(s)", "s = s + s\n".repeat(40));
    let report = settle(submit(&scheduler, &doubling)).await;
    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report.error.unwrap().contains("value too large"));

    let report = settle(submit(&scheduler, "resolve('still here')")).await;
    assert_eq!(report.status, TaskStatus::Done);
    assert_eq!(report.output, json!("still here"));
    assert_eq!(scheduler.pool_length(), 0);
}
