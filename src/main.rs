//! Hive HTTP 服务
//!
//! 启动: cargo run --bin hive
//! - `GET /`      健康检查
//! - `GET /stats` 调度器统计
//! - `POST /task` 提交 `{script, options?, profile?}`，DONE 返回 200，其他终态返回 500

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use hive::agent::create_provider;
use hive::api;
use hive::config::load_config;
use hive::core::scheduler::{Scheduler, SchedulerConfig};
use hive::core::shutdown::{SchedulerCleanup, ShutdownCoordinator, ShutdownManager};
use hive::core::task::TaskReport;
use hive::observability;
use hive::script::Interpreter;

struct AppState {
    scheduler: Scheduler,
    /// 启动时间（毫秒）
    started_at: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let provider = create_provider(&cfg.agent).context("Failed to create agent provider")?;
    let scheduler = Scheduler::new(
        SchedulerConfig::from(&cfg.scheduler),
        provider,
        Arc::new(Interpreter::new()),
    )
    .context("Failed to create scheduler")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown)).with_timeout(15);
    coordinator.register(SchedulerCleanup::new(scheduler.clone()));

    let state = Arc::new(AppState {
        scheduler,
        started_at: chrono::Utc::now().timestamp_millis(),
    });

    let app = Router::new()
        .route("/", get(|| async { Json(json!({"health": "ok"})) }))
        .route("/stats", get(api_stats))
        .route("/task", post(api_task))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.bind_addr))?;
    tracing::info!("Hive listening on http://{}", cfg.server.bind_addr);

    // 先关闭调度器，挂起中的 /task 请求才能拿到结果并返回
    let mut reasons = shutdown.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            coordinator.manager().wait_for_shutdown().await;
            match reasons.try_recv() {
                Ok(reason) => tracing::info!("Shutting down: {:?}", reason),
                Err(_) => tracing::info!("Shutting down"),
            }
            coordinator.run_cleanup().await;
        })
        .await
        .context("HTTP server failed")?;

    tracing::info!("Hive stopped");
    Ok(())
}

async fn api_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "startedAt": state.started_at,
        "task": state.scheduler.stats(),
    }))
}

async fn api_task(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    if let Err(e) = api::submit_body(&state.scheduler, &body, move |report| {
        let _ = tx.send(report);
    }) {
        tracing::error!("Task submission failed: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "FAILED", "error": e.to_string()})),
        );
    }

    match rx.await {
        Ok(report) => respond(report),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "FAILED", "error": "Task dropped without a result"})),
        ),
    }
}

fn respond(report: TaskReport) -> (StatusCode, Json<Value>) {
    let code = StatusCode::from_u16(api::response_status(&report))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(api::response_body(&report)))
}
