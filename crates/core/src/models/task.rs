use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::server::ServerIdentity;

/// 执行任务：派发给单个Worker的最小工作单元
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub instance_id: i64,
    /// 分片序号（1开始）与总分片数
    pub task_no: i32,
    pub task_count: i32,
    pub param: String,
    /// 路由后指派的Worker；未路由时为空
    pub worker: Option<ServerIdentity>,
    pub execute_state: ExecuteState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error_msg: Option<String>,
    pub dispatch_failed_count: i32,
}

/// 任务执行状态机
///
/// WAITING -> EXECUTING -> {FINISHED, FAILED, CANCELED}；
/// FAILED在重试预算允许时可回到WAITING。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecuteState {
    #[serde(rename = "WAITING")]
    Waiting,
    #[serde(rename = "EXECUTING")]
    Executing,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELED")]
    Canceled,
}

impl ExecuteState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecuteState::Finished | ExecuteState::Failed | ExecuteState::Canceled
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ExecuteState::Failed | ExecuteState::Canceled)
    }

    pub fn can_transition_to(&self, to: ExecuteState) -> bool {
        use ExecuteState::*;
        match (self, to) {
            (Waiting, Executing) | (Waiting, Canceled) => true,
            (Executing, Finished) | (Executing, Failed) | (Executing, Canceled) => true,
            // 暂停路径：任务退回等待，恢复时重新派发，不消耗重试预算
            (Executing, Waiting) => true,
            // 重试路径：消耗一单位重试预算
            (Failed, Waiting) => true,
            _ => false,
        }
    }

    /// 任务状态到实例状态的聚合映射
    pub fn run_state(&self) -> super::RunState {
        use super::RunState;
        match self {
            ExecuteState::Waiting => RunState::Waiting,
            ExecuteState::Executing => RunState::Running,
            ExecuteState::Finished => RunState::Finished,
            ExecuteState::Failed => RunState::Failed,
            ExecuteState::Canceled => RunState::Canceled,
        }
    }
}

impl Task {
    pub fn new(instance_id: i64, task_no: i32, task_count: i32, param: String) -> Self {
        Self {
            id: 0,
            instance_id,
            task_no,
            task_count,
            param,
            worker: None,
            execute_state: ExecuteState::Waiting,
            started_at: None,
            ended_at: None,
            result: None,
            error_msg: None,
            dispatch_failed_count: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.execute_state.is_terminal()
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.execute_state, ExecuteState::Waiting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunState;

    #[test]
    fn test_execute_state_transitions() {
        assert!(ExecuteState::Waiting.can_transition_to(ExecuteState::Executing));
        assert!(ExecuteState::Executing.can_transition_to(ExecuteState::Finished));
        assert!(ExecuteState::Executing.can_transition_to(ExecuteState::Failed));
        assert!(ExecuteState::Failed.can_transition_to(ExecuteState::Waiting));
        assert!(!ExecuteState::Finished.can_transition_to(ExecuteState::Waiting));
        assert!(!ExecuteState::Canceled.can_transition_to(ExecuteState::Executing));
        // 不允许未执行直接完成
        assert!(!ExecuteState::Waiting.can_transition_to(ExecuteState::Finished));
    }

    #[test]
    fn test_execute_to_run_state_mapping() {
        assert_eq!(ExecuteState::Executing.run_state(), RunState::Running);
        assert_eq!(ExecuteState::Finished.run_state(), RunState::Finished);
        assert_eq!(ExecuteState::Canceled.run_state(), RunState::Canceled);
    }
}
