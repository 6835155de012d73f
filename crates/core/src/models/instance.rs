use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 执行实例：Job的一次运行
///
/// 由扫描循环或手动触发创建，随task汇报推进状态；终态后成为不可变的历史记录。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub job_id: i64,
    pub trigger_time: DateTime<Utc>,
    pub run_type: RunType,
    pub run_state: RunState,
    /// 直接父实例（重试来源或workflow父实例）
    pub parent_instance_id: Option<i64>,
    /// 同一DAG触发派生的兄弟实例共享此id
    pub workflow_instance_id: Option<i64>,
    /// DAG节点位置等附加信息（JSON）
    pub attach: Option<String>,
    pub retried_count: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunType {
    #[serde(rename = "SCHEDULED")]
    Scheduled,
    #[serde(rename = "MANUAL")]
    Manual,
    #[serde(rename = "RETRY")]
    Retry,
    #[serde(rename = "DEPEND")]
    Depend,
}

/// 实例运行状态机
///
/// WAITING -> RUNNING -> {FINISHED, CANCELED, FAILED}，RUNNING <-> PAUSED。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunState {
    #[serde(rename = "WAITING")]
    Waiting,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "FAILED")]
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Finished | RunState::Canceled | RunState::Failed)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunState::Canceled | RunState::Failed)
    }

    pub fn can_transition_to(&self, to: RunState) -> bool {
        use RunState::*;
        match (self, to) {
            (Waiting, Running) | (Waiting, Canceled) => true,
            // 分裂失败路径：未产生任何task即实例级失败
            (Waiting, Failed) => true,
            (Running, Finished) | (Running, Canceled) | (Running, Failed) | (Running, Paused) => {
                true
            }
            (Paused, Running) | (Paused, Canceled) => true,
            _ => false,
        }
    }
}

impl Instance {
    pub fn new(job_id: i64, trigger_time: DateTime<Utc>, run_type: RunType) -> Self {
        Self {
            id: 0,
            job_id,
            trigger_time,
            run_type,
            run_state: RunState::Waiting,
            parent_instance_id: None,
            workflow_instance_id: None,
            attach: None,
            retried_count: 0,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.run_state.is_terminal()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.run_state, RunState::Running)
    }

    /// 是否为workflow父实例（workflow_instance_id指向自身）
    pub fn is_workflow_parent(&self) -> bool {
        self.workflow_instance_id == Some(self.id)
    }

    /// 是否为workflow子节点实例
    pub fn is_workflow_node(&self) -> bool {
        matches!(self.workflow_instance_id, Some(wid) if wid != self.id)
    }
}
