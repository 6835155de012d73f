use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::server::ServerIdentity;

/// 派发失败事件
///
/// 派发器遇到不可达Worker或传输错误时记录此事件而非同步重试；
/// 扫描循环的恢复通道基于最新发现快照重新路由后再派发。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchFailedEvent {
    pub job_id: i64,
    pub instance_id: i64,
    pub task_id: i64,
    pub worker: Option<ServerIdentity>,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

impl DispatchFailedEvent {
    pub fn new(job_id: i64, instance_id: i64, task_id: i64, worker: Option<ServerIdentity>, reason: String) -> Self {
        Self {
            job_id,
            instance_id,
            task_id,
            worker,
            reason,
            occurred_at: Utc::now(),
        }
    }
}
