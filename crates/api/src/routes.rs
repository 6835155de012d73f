use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use disched_core::traits::{InstanceRepository, JobRepository, TaskRepository};
use disched_supervisor::{JobSplitter, LifecycleService, SupervisorEngine};

use crate::handlers::{
    health::health_check,
    instances::{
        cancel_instance, get_instance, list_children, list_instances, pause_instance,
        resume_instance,
    },
    jobs::{create_job, delete_job, get_job, list_jobs, set_job_state, trigger_job, update_job},
    report::receive_report,
};

/// 管理API应用状态
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobRepository>,
    pub instances: Arc<dyn InstanceRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub splitter: Arc<JobSplitter>,
    pub engine: Arc<SupervisorEngine>,
}

impl AppState {
    pub fn lifecycle(&self) -> Arc<LifecycleService> {
        self.engine.lifecycle()
    }
}

/// 创建管理API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // 任务定义管理
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/update", post(update_job))
        .route("/api/jobs/{id}/delete", post(delete_job))
        .route("/api/jobs/{id}/state", post(set_job_state))
        .route("/api/jobs/{id}/trigger", post(trigger_job))
        // 执行实例管理
        .route("/api/instances", get(list_instances))
        .route("/api/instances/{id}", get(get_instance))
        .route("/api/instances/{id}/children", get(list_children))
        .route("/api/instances/{id}/pause", post(pause_instance))
        .route("/api/instances/{id}/cancel", post(cancel_instance))
        .route("/api/instances/{id}/resume", post(resume_instance))
        // Worker执行汇报入口
        .route("/api/v1/report", post(receive_report))
        .layer(crate::middleware::trace_layer())
        .layer(crate::middleware::cors_layer())
        .with_state(state)
}
