pub mod channel;
pub mod http;

pub use channel::ChannelTaskDispatcher;
pub use http::{HttpTaskDispatcher, HttpTaskReporter};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use disched_core::errors::SchedulerResult;
use disched_core::models::{DispatchFailedEvent, DispatchPayload};
use disched_core::traits::DispatchEventRepository;

/// 任务派发传输
///
/// 单次投递语义：把一条载荷送达其`worker`字段指定的节点。
/// 重试与失败转事件由上层[`ReliableDispatcher`]负责。
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, payload: &DispatchPayload) -> SchedulerResult<()>;
}

/// Worker侧接收端
///
/// 返回`Ok(false)`表示容量已满拒收，派发方视同投递失败走恢复通道。
#[async_trait]
pub trait TaskReceiver: Send + Sync {
    async fn receive(&self, payload: DispatchPayload) -> SchedulerResult<bool>;
}

/// 可靠派发：有限次同步重试，穷尽后失败转事件
///
/// 投递失败不向调用方冒泡——事件被记录后本轮即视为完成，
/// 扫描循环的恢复通道会基于最新的发现快照重新路由再派发。
/// 这保证单个不可达Worker不会阻塞同批其他任务的派发。
pub struct ReliableDispatcher {
    inner: Arc<dyn TaskDispatcher>,
    events: Arc<dyn DispatchEventRepository>,
    max_attempts: u32,
    retry_delay_ms: u64,
}

impl ReliableDispatcher {
    pub fn new(
        inner: Arc<dyn TaskDispatcher>,
        events: Arc<dyn DispatchEventRepository>,
        max_attempts: u32,
        retry_delay_ms: u64,
    ) -> Self {
        Self {
            inner,
            events,
            max_attempts: max_attempts.max(1),
            retry_delay_ms,
        }
    }

    pub async fn dispatch(&self, payload: &DispatchPayload) -> SchedulerResult<()> {
        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            match self.inner.dispatch(payload).await {
                Ok(()) => {
                    debug!(
                        "任务 {} 已派发至 {}（第{}次尝试）",
                        payload.task_id, payload.worker, attempt
                    );
                    return Ok(());
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    warn!(
                        "任务 {} 派发至 {} 失败（第{}/{}次）: {e}",
                        payload.task_id, payload.worker, attempt, self.max_attempts
                    );
                    last_err = Some(e);
                    if !retryable {
                        break;
                    }
                    if attempt < self.max_attempts && self.retry_delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(self.retry_delay_ms)).await;
                    }
                }
            }
        }
        let reason = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "未知派发错误".to_string());
        self.events
            .record(DispatchFailedEvent::new(
                payload.job_id,
                payload.instance_id,
                payload.task_id,
                Some(payload.worker.clone()),
                reason,
            ))
            .await?;
        Ok(())
    }
}
