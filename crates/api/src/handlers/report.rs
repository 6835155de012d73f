use axum::extract::State;
use axum::Json;

use disched_core::models::TaskReport;

use crate::error::ApiResult;
use crate::response::ApiResponse;
use crate::routes::AppState;

/// Worker执行汇报入口
///
/// 凭据校验与状态机推进在LifecycleService内完成；
/// 凭据不符经错误映射返回401。
pub async fn receive_report(
    State(state): State<AppState>,
    Json(report): Json<TaskReport>,
) -> ApiResult<ApiResponse<()>> {
    state.lifecycle().handle_report(&report).await?;
    Ok(ApiResponse::success_empty())
}
