use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use disched_core::errors::SchedulerError;

/// 管理API错误：调度错误到HTTP状态码的映射
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("调度器错误: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Scheduler(e) => (scheduler_status(e), e.to_string()),
        };
        let body = Json(json!({
            "success": false,
            "error": {
                "message": message,
                "code": status.as_u16(),
            },
            "timestamp": chrono::Utc::now(),
        }));
        (status, body).into_response()
    }
}

fn scheduler_status(e: &SchedulerError) -> StatusCode {
    match e {
        SchedulerError::JobNotFound { .. }
        | SchedulerError::InstanceNotFound { .. }
        | SchedulerError::TaskNotFound { .. }
        | SchedulerError::GroupNotFound { .. }
        | SchedulerError::HandlerNotFound { .. } => StatusCode::NOT_FOUND,
        SchedulerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        SchedulerError::IllegalStateTransition { .. } | SchedulerError::ConflictedUpdate(_) => {
            StatusCode::CONFLICT
        }
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let response = ApiError::Scheduler(SchedulerError::JobNotFound { id: 9 }).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_validation_maps_to_400() {
        let response =
            ApiError::Scheduler(SchedulerError::invalid_params("坏参数")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ApiError::Scheduler(SchedulerError::InvalidCron {
            expr: "x".into(),
            message: "坏表达式".into(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_illegal_transition_maps_to_409() {
        let response = ApiError::Scheduler(SchedulerError::IllegalStateTransition {
            from: "FINISHED".into(),
            to: "RUNNING".into(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_unauthorized_maps_to_401() {
        let response =
            ApiError::Scheduler(SchedulerError::Unauthorized("token".into())).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_infra_maps_to_500() {
        let response = ApiError::Scheduler(SchedulerError::Store("挂了".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
