use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use disched_core::errors::SchedulerError;
use disched_core::models::{Instance, InstancePageQuery, Page, Task};

use crate::error::ApiResult;
use crate::response::ApiResponse;
use crate::routes::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct InstanceDetailQuery {
    pub with_tasks: Option<bool>,
}

/// 实例详情：可选携带其task分片
#[derive(Debug, Serialize)]
pub struct InstanceDetail {
    #[serde(flatten)]
    pub instance: Instance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Task>>,
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<InstanceDetailQuery>,
) -> ApiResult<ApiResponse<InstanceDetail>> {
    let instance = state
        .instances
        .get_by_id(id)
        .await?
        .ok_or(SchedulerError::InstanceNotFound { id })?;
    let tasks = if query.with_tasks.unwrap_or(false) {
        Some(state.tasks.find_by_instance(id).await?)
    } else {
        None
    };
    Ok(ApiResponse::success(InstanceDetail { instance, tasks }))
}

pub async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<InstancePageQuery>,
) -> ApiResult<ApiResponse<Page<Instance>>> {
    Ok(ApiResponse::success(
        state.instances.page_query(&query).await?,
    ))
}

pub async fn list_children(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ApiResponse<Vec<Instance>>> {
    // 先确认父实例存在，避免把空子集误报为成功
    state
        .instances
        .get_by_id(id)
        .await?
        .ok_or(SchedulerError::InstanceNotFound { id })?;
    Ok(ApiResponse::success(
        state.instances.find_children(id).await?,
    ))
}

pub async fn pause_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ApiResponse<()>> {
    state.lifecycle().pause_instance(id).await?;
    Ok(ApiResponse::success_with_message(format!("实例 {id} 已暂停")))
}

pub async fn cancel_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ApiResponse<()>> {
    state.lifecycle().cancel_instance(id).await?;
    Ok(ApiResponse::success_with_message(format!("实例 {id} 已取消")))
}

pub async fn resume_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ApiResponse<()>> {
    state.lifecycle().resume_instance(id).await?;
    Ok(ApiResponse::success_with_message(format!("实例 {id} 已恢复")))
}
