use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use disched_core::models::DispatchPayload;
use disched_core::traits::GroupRepository;
use disched_dispatch::http::TOKEN_HEADER;

use crate::service::WorkerService;

/// Worker RPC路由状态
#[derive(Clone)]
pub struct RpcState {
    pub service: Arc<WorkerService>,
    pub groups: Arc<dyn GroupRepository>,
}

/// Worker侧RPC端点
///
/// supervisor经HTTP传输调用；凭据为本分组worker_token，
/// 凭据不符是硬失败（401），不落恢复通道。
pub fn rpc_routes(state: RpcState) -> Router {
    Router::new()
        .route("/rpc/receive", post(receive))
        .route("/rpc/verify", post(verify))
        .route("/rpc/split", post(split))
        .route("/rpc/metrics", get(metrics))
        .route("/rpc/pool/resize", post(resize_pool))
        .with_state(state)
}

type RpcError = (StatusCode, Json<Value>);

fn rpc_error(status: StatusCode, message: impl Into<String>) -> RpcError {
    (status, Json(json!({ "error": message.into() })))
}

/// 校验来访凭据；分组未配置时放行（单机联调）
async fn authorize(state: &RpcState, headers: &HeaderMap) -> Result<(), RpcError> {
    let group_name = &state.service.identity().group;
    let group = state
        .groups
        .get(group_name)
        .await
        .map_err(|e| rpc_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let Some(group) = group else {
        return Ok(());
    };
    let presented = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != group.worker_token {
        warn!("分组 {group_name} 的RPC凭据校验失败");
        return Err(rpc_error(StatusCode::UNAUTHORIZED, "凭据无效"));
    }
    Ok(())
}

async fn receive(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(payload): Json<DispatchPayload>,
) -> Result<Json<Value>, RpcError> {
    authorize(&state, &headers).await?;
    let accepted = disched_dispatch::TaskReceiver::receive(state.service.as_ref(), payload)
        .await
        .map_err(|e| rpc_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "accepted": accepted })))
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    handler: String,
    param: String,
}

async fn verify(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<Value>, RpcError> {
    authorize(&state, &headers).await?;
    let handler = state
        .service
        .handlers()
        .get(&req.handler)
        .map_err(|e| rpc_error(StatusCode::NOT_FOUND, e.to_string()))?;
    match handler.verify(&req.param) {
        Ok(()) => Ok(Json(json!({ "valid": true }))),
        Err(e) => Err(rpc_error(StatusCode::BAD_REQUEST, e.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct SplitRequest {
    handler: String,
    group: String,
    param: String,
}

async fn split(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(req): Json<SplitRequest>,
) -> Result<Json<Vec<String>>, RpcError> {
    authorize(&state, &headers).await?;
    let handler = state
        .service
        .handlers()
        .get(&req.handler)
        .map_err(|e| rpc_error(StatusCode::NOT_FOUND, e.to_string()))?;
    let params = handler
        .split(&req.group, &req.param)
        .map_err(|e| rpc_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(params))
}

async fn metrics(
    State(state): State<RpcState>,
    headers: HeaderMap,
) -> Result<Json<Value>, RpcError> {
    authorize(&state, &headers).await?;
    let snapshot = state.service.metrics();
    Ok(Json(json!({
        "worker": state.service.identity().to_string(),
        "capacity": snapshot.capacity,
        "running": snapshot.running,
        "queued": snapshot.queued,
    })))
}

#[derive(Debug, Deserialize)]
struct ResizeRequest {
    capacity: usize,
}

async fn resize_pool(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(req): Json<ResizeRequest>,
) -> Result<Json<Value>, RpcError> {
    authorize(&state, &headers).await?;
    if req.capacity == 0 {
        return Err(rpc_error(StatusCode::BAD_REQUEST, "容量必须大于0"));
    }
    state.service.resize_pool(req.capacity);
    Ok(Json(json!({ "capacity": req.capacity })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use async_trait::async_trait;
    use chrono::Utc;
    use disched_core::errors::SchedulerResult;
    use disched_core::memory::MemoryStore;
    use disched_core::models::{
        Group, JobType, Operation, RouteStrategy, ServerIdentity, ShutdownStrategy, TaskReport,
    };
    use disched_core::traits::TaskReporter;
    use disched_core::HandlerRegistry;

    struct NullReporter;

    #[async_trait]
    impl TaskReporter for NullReporter {
        async fn report(&self, _report: TaskReport) -> SchedulerResult<()> {
            Ok(())
        }
    }

    async fn state_with_group() -> (RpcState, String) {
        let store = Arc::new(MemoryStore::new());
        let mut group = Group::new("etl", "ops");
        group.worker_token = "secret-token".to_string();
        let token = group.worker_token.clone();
        store.upsert(group).await.unwrap();

        let service = Arc::new(WorkerService::new(
            ServerIdentity::new("etl", "w1", "127.0.0.1", 8200),
            Arc::new(HandlerRegistry::with_builtin()),
            Arc::new(NullReporter),
            4,
            1000,
            60,
        ));
        (
            RpcState {
                service,
                groups: store,
            },
            token,
        )
    }

    fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn payload_json(task_id: i64) -> Value {
        serde_json::to_value(DispatchPayload {
            operation: Operation::Trigger,
            task_id,
            task_no: 1,
            task_count: 1,
            instance_id: 1,
            workflow_instance_id: None,
            trigger_time: Utc::now(),
            job_id: 1,
            job_type: JobType::Normal,
            job_handler: "noop".to_string(),
            task_param: String::new(),
            route_strategy: RouteStrategy::RoundRobin,
            shutdown_strategy: ShutdownStrategy::Resume,
            execute_timeout_ms: 60_000,
            supervisor_token: String::new(),
            worker: ServerIdentity::new("etl", "w1", "127.0.0.1", 8200),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_receive_requires_valid_token() {
        let (state, _token) = state_with_group().await;
        let app = rpc_routes(state);

        let response = app
            .clone()
            .oneshot(post_json("/rpc/receive", Some("wrong"), payload_json(1)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(post_json("/rpc/receive", None, payload_json(1)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_receive_accepts_within_capacity() {
        let (state, token) = state_with_group().await;
        let app = rpc_routes(state);
        let response = app
            .oneshot(post_json("/rpc/receive", Some(&token), payload_json(7)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["accepted"], json!(true));
    }

    #[tokio::test]
    async fn test_receive_rejects_when_pool_full() {
        let (state, token) = state_with_group().await;
        state.service.resize_pool(1);
        let app = rpc_routes(state);

        let first = app
            .clone()
            .oneshot(post_json("/rpc/receive", Some(&token), payload_json(1)))
            .await
            .unwrap();
        let bytes = to_bytes(first.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&bytes).unwrap()["accepted"],
            json!(true)
        );

        let second = app
            .oneshot(post_json("/rpc/receive", Some(&token), payload_json(2)))
            .await
            .unwrap();
        let bytes = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        // 容量满时仍是200，以accepted=false表达拒收
        assert_eq!(
            serde_json::from_slice::<Value>(&bytes).unwrap()["accepted"],
            json!(false)
        );
    }

    #[tokio::test]
    async fn test_verify_reports_invalid_param() {
        let (state, token) = state_with_group().await;
        let app = rpc_routes(state);

        let ok = app
            .clone()
            .oneshot(post_json(
                "/rpc/verify",
                Some(&token),
                json!({"handler": "sleep", "param": "100"}),
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let bad = app
            .oneshot(post_json(
                "/rpc/verify",
                Some(&token),
                json!({"handler": "sleep", "param": "abc"}),
            ))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_and_resize() {
        let (state, token) = state_with_group().await;
        let app = rpc_routes(state.clone());

        let response = app
            .clone()
            .oneshot(post_json("/rpc/pool/resize", Some(&token), json!({"capacity": 2})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/rpc/metrics")
                    .header(TOKEN_HEADER, &token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["capacity"], json!(2));
        assert_eq!(body["running"], json!(0));
    }
}
