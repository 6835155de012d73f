use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use disched_core::errors::SchedulerError;
use disched_core::models::{
    CollisionStrategy, Job, JobPageQuery, JobState, JobType, MisfireStrategy, Page, RetryType,
    RouteStrategy, TriggerType,
};
use disched_supervisor::trigger_time;

use crate::error::{ApiError, ApiResult};
use crate::response::ApiResponse;
use crate::routes::AppState;

/// 任务定义请求体：创建与更新共用，缺省字段取[`Job::new`]默认值
#[derive(Debug, Deserialize)]
pub struct JobRequest {
    pub group: String,
    pub name: String,
    pub handler: String,
    pub trigger_type: TriggerType,
    pub trigger_value: String,
    pub job_type: Option<JobType>,
    pub param: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub misfire_strategy: Option<MisfireStrategy>,
    pub collision_strategy: Option<CollisionStrategy>,
    pub retry_type: Option<RetryType>,
    pub retry_count: Option<i32>,
    pub retry_interval_ms: Option<i64>,
    pub route_strategy: Option<RouteStrategy>,
    pub execute_timeout_ms: Option<i64>,
}

impl JobRequest {
    /// 把请求体覆盖到job上（不触碰id/version/触发进度字段）
    fn apply(&self, job: &mut Job) {
        job.group = self.group.clone();
        job.name = self.name.clone();
        job.handler = self.handler.clone();
        job.trigger_type = self.trigger_type;
        job.trigger_value = self.trigger_value.clone();
        if let Some(v) = self.job_type {
            job.job_type = v;
        }
        if let Some(v) = &self.param {
            job.param = v.clone();
        }
        job.start_time = self.start_time;
        job.end_time = self.end_time;
        if let Some(v) = self.misfire_strategy {
            job.misfire_strategy = v;
        }
        if let Some(v) = self.collision_strategy {
            job.collision_strategy = v;
        }
        if let Some(v) = self.retry_type {
            job.retry_type = v;
        }
        if let Some(v) = self.retry_count {
            job.retry_count = v;
        }
        if let Some(v) = self.retry_interval_ms {
            job.retry_interval_ms = v;
        }
        if let Some(v) = self.route_strategy {
            job.route_strategy = v;
        }
        if let Some(v) = self.execute_timeout_ms {
            job.execute_timeout_ms = v;
        }
    }
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> ApiResult<ApiResponse<Job>> {
    let mut job = Job::new(
        req.group.clone(),
        req.name.clone(),
        req.handler.clone(),
        req.trigger_type,
        req.trigger_value.clone(),
    );
    req.apply(&mut job);
    // 坏定义在管理边界同步拒绝，永不进入运行期
    state.splitter.verify_job(&job)?;
    job.next_trigger_time = trigger_time::initial_trigger_time(&job, Utc::now())?;
    let created = state.jobs.create(&job).await?;
    info!("任务已创建: {} ({})", created.name, created.id);
    Ok(ApiResponse::success(created))
}

pub async fn update_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<JobRequest>,
) -> ApiResult<ApiResponse<Job>> {
    let mut job = state
        .jobs
        .get_by_id(id)
        .await?
        .ok_or(SchedulerError::JobNotFound { id })?;
    req.apply(&mut job);
    state.splitter.verify_job(&job)?;
    // 触发配置可能已变化，按新配置重排下一次触发
    job.next_trigger_time = trigger_time::initial_trigger_time(&job, Utc::now())?;
    if !state.jobs.update(&job).await? {
        return Err(ApiError::Scheduler(SchedulerError::ConflictedUpdate(
            format!("任务 {id} 更新冲突"),
        )));
    }
    let updated = state
        .jobs
        .get_by_id(id)
        .await?
        .ok_or(SchedulerError::JobNotFound { id })?;
    Ok(ApiResponse::success(updated))
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ApiResponse<()>> {
    if !state.jobs.delete(id).await? {
        return Err(ApiError::Scheduler(SchedulerError::JobNotFound { id }));
    }
    info!("任务已删除: {id}");
    Ok(ApiResponse::success_empty())
}

#[derive(Debug, Deserialize)]
pub struct StateRequest {
    pub state: JobState,
}

pub async fn set_job_state(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<StateRequest>,
) -> ApiResult<ApiResponse<()>> {
    if !state.jobs.update_state(id, req.state).await? {
        return Err(ApiError::Scheduler(SchedulerError::JobNotFound { id }));
    }
    info!("任务 {id} 状态置为 {:?}", req.state);
    Ok(ApiResponse::success_empty())
}

pub async fn trigger_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ApiResponse<Value>> {
    let instance_id = state.engine.trigger_job_now(id).await?;
    // None表示碰撞策略丢弃了本次触发
    Ok(ApiResponse::success(json!({ "instance_id": instance_id })))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ApiResponse<Job>> {
    let job = state
        .jobs
        .get_by_id(id)
        .await?
        .ok_or(SchedulerError::JobNotFound { id })?;
    Ok(ApiResponse::success(job))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobPageQuery>,
) -> ApiResult<ApiResponse<Page<Job>>> {
    Ok(ApiResponse::success(state.jobs.page_query(&query).await?))
}
