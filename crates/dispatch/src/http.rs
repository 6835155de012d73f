use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use disched_core::errors::{SchedulerError, SchedulerResult};
use disched_core::models::{DispatchPayload, ServerRole, TaskReport};
use disched_core::traits::{GroupRepository, TaskReporter};
use disched_registry::ServerRegistry;

/// 鉴权头：携带目标所属group的共享凭据
pub const TOKEN_HEADER: &str = "x-disched-token";

#[derive(Debug, Deserialize)]
struct ReceiveResponse {
    accepted: bool,
}

/// HTTP传输：POST到目标Worker的接收端点
///
/// 凭据按group查询：派发携带worker_token，Worker侧校验后才接收。
pub struct HttpTaskDispatcher {
    client: reqwest::Client,
    groups: Arc<dyn GroupRepository>,
}

impl HttpTaskDispatcher {
    pub fn new(groups: Arc<dyn GroupRepository>, timeout_ms: u64) -> SchedulerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| SchedulerError::config_error(format!("HTTP客户端构建失败: {e}")))?;
        Ok(Self { client, groups })
    }
}

#[async_trait]
impl crate::TaskDispatcher for HttpTaskDispatcher {
    async fn dispatch(&self, payload: &DispatchPayload) -> SchedulerResult<()> {
        let group = self
            .groups
            .get(&payload.worker.group)
            .await?
            .ok_or_else(|| SchedulerError::GroupNotFound {
                name: payload.worker.group.clone(),
            })?;
        let url = format!(
            "http://{}:{}/rpc/receive",
            payload.worker.host, payload.worker.port
        );
        let response = self
            .client
            .post(&url)
            .header(TOKEN_HEADER, &group.worker_token)
            .json(payload)
            .send()
            .await
            .map_err(|e| SchedulerError::Network(format!("派发请求 {url} 失败: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SchedulerError::Unauthorized(format!(
                "Worker {} 拒绝派发凭据",
                payload.worker
            )));
        }
        if !status.is_success() {
            return Err(SchedulerError::DispatchFailed(format!(
                "Worker {} 返回 {status}",
                payload.worker
            )));
        }
        let body: ReceiveResponse = response
            .json()
            .await
            .map_err(|e| SchedulerError::Network(format!("接收响应解析失败: {e}")))?;
        if body.accepted {
            debug!("任务 {} 经HTTP投递至 {}", payload.task_id, payload.worker);
            Ok(())
        } else {
            Err(SchedulerError::DispatchFailed(format!(
                "Worker {} 容量已满拒收",
                payload.worker
            )))
        }
    }
}

/// HTTP汇报通道：Worker经注册中心发现存活supervisor后上报
///
/// 从随机起点轮询候选，任一supervisor接受即成功；汇报载荷内的
/// supervisor_token由接收方校验。
pub struct HttpTaskReporter {
    client: reqwest::Client,
    registry: Arc<dyn ServerRegistry>,
}

impl HttpTaskReporter {
    pub fn new(registry: Arc<dyn ServerRegistry>, timeout_ms: u64) -> SchedulerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| SchedulerError::config_error(format!("HTTP客户端构建失败: {e}")))?;
        Ok(Self { client, registry })
    }
}

#[async_trait]
impl TaskReporter for HttpTaskReporter {
    async fn report(&self, report: TaskReport) -> SchedulerResult<()> {
        let supervisors = self.registry.discover(ServerRole::Supervisor, "").await?;
        if supervisors.is_empty() {
            return Err(SchedulerError::Network(
                "没有可用的supervisor接收汇报".to_string(),
            ));
        }
        let start = rand::rng().random_range(0..supervisors.len());
        let mut last_err = None;
        for i in 0..supervisors.len() {
            let supervisor = &supervisors[(start + i) % supervisors.len()];
            let url = format!("http://{}:{}/api/v1/report", supervisor.host, supervisor.port);
            match self.client.post(&url).json(&report).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    warn!("supervisor {supervisor} 拒绝汇报: {}", response.status());
                    last_err = Some(SchedulerError::Network(format!(
                        "汇报被拒绝: {}",
                        response.status()
                    )));
                }
                Err(e) => {
                    warn!("supervisor {supervisor} 汇报失败: {e}");
                    last_err = Some(SchedulerError::Network(e.to_string()));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SchedulerError::Network("汇报失败".to_string())))
    }
}
