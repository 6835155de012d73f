use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("参数校验失败: {0}")]
    InvalidParams(String),
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("无效的DAG定义: {0}")]
    InvalidDag(String),
    #[error("认证失败: {0}")]
    Unauthorized(String),
    #[error("任务未找到: {id}")]
    JobNotFound { id: i64 },
    #[error("执行实例未找到: {id}")]
    InstanceNotFound { id: i64 },
    #[error("执行任务未找到: {id}")]
    TaskNotFound { id: i64 },
    #[error("分组未找到: {name}")]
    GroupNotFound { name: String },
    #[error("处理器未注册: {name}")]
    HandlerNotFound { name: String },
    #[error("非法状态迁移: {from} -> {to}")]
    IllegalStateTransition { from: String, to: String },
    #[error("乐观锁更新冲突: {0}")]
    ConflictedUpdate(String),
    #[error("没有可用的Worker节点: {0}")]
    NoAvailableWorker(String),
    #[error("任务派发失败: {0}")]
    DispatchFailed(String),
    #[error("注册中心不可用: {0}")]
    RegistryUnavailable(String),
    #[error("注册中心后端冲突: {0}")]
    RegistryConflict(String),
    #[error("存储错误: {0}")]
    Store(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("任务执行超时")]
    ExecutionTimeout,
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParams(msg.into())
    }
    pub fn store_error<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 致命错误：进程不应继续启动/运行
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Configuration(_)
                | SchedulerError::RegistryConflict(_)
                | SchedulerError::Internal(_)
        )
    }

    /// 瞬时基础设施错误：按退避重试，重试耗尽后转为派发失败事件
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Store(_)
                | SchedulerError::Network(_)
                | SchedulerError::RegistryUnavailable(_)
                | SchedulerError::DispatchFailed(_)
                | SchedulerError::NoAvailableWorker(_)
        )
    }

    /// 校验/认证类错误：同步拒绝，绝不重试
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidParams(_)
                | SchedulerError::InvalidCron { .. }
                | SchedulerError::InvalidDag(_)
                | SchedulerError::Unauthorized(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SchedulerError::Configuration("bad".into()).is_fatal());
        assert!(SchedulerError::RegistryConflict("dup".into()).is_fatal());
        assert!(!SchedulerError::Network("down".into()).is_fatal());

        assert!(SchedulerError::Network("down".into()).is_retryable());
        assert!(SchedulerError::NoAvailableWorker("g".into()).is_retryable());
        assert!(!SchedulerError::InvalidDag("cycle".into()).is_retryable());

        assert!(SchedulerError::Unauthorized("token".into()).is_validation());
        assert!(!SchedulerError::Store("timeout".into()).is_validation());
    }
}
