pub mod heartbeat;
pub mod memory;
pub mod redis_backend;

pub use heartbeat::spawn_session_keeper;
pub use memory::{MemoryRegistryHub, MemoryServerRegistry};
pub use redis_backend::{RedisAtomicCounter, RedisServerRegistry};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use disched_core::errors::{SchedulerError, SchedulerResult};
use disched_core::models::{ServerIdentity, ServerRole};

/// 集群成员注册与发现
///
/// 对supervisor和worker对称：注册自身身份（带会话TTL，需周期续约），
/// 发现对端角色的存活成员。崩溃进程的条目必须在一个会话超时周期内
/// 因缺席而消失，不依赖崩溃方主动注销。
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    /// 发布自身身份，开启TTL会话
    async fn register(&self, role: ServerRole, identity: &ServerIdentity) -> SchedulerResult<()>;

    /// 续约会话TTL；在TTL的固定子区间调用，容忍一次心跳丢失
    async fn renew(&self, role: ServerRole, identity: &ServerIdentity) -> SchedulerResult<()>;

    async fn deregister(&self, role: ServerRole, identity: &ServerIdentity) -> SchedulerResult<()>;

    /// 当前存活的指定角色成员，按group过滤（空串不过滤）
    async fn discover(&self, role: ServerRole, group: &str) -> SchedulerResult<Vec<ServerIdentity>>;

    /// 注销并释放会话资源
    async fn close(&self) -> SchedulerResult<()>;
}

/// 后端排他启动检查
///
/// 每进程恰好一个注册中心后端处于激活状态；第二次并发激活是
/// 致命的启动错误而非静默覆盖。进程启动时构造一次，注入给装配层。
pub struct ExclusiveRegistryGuard {
    activated: AtomicBool,
}

impl ExclusiveRegistryGuard {
    pub fn new() -> Self {
        Self {
            activated: AtomicBool::new(false),
        }
    }

    /// 激活一个后端；重复激活返回RegistryConflict
    pub fn activate(&self, backend_name: &str) -> SchedulerResult<()> {
        if self.activated.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::RegistryConflict(format!(
                "注册中心后端 {backend_name} 激活失败：已有后端处于激活状态"
            )));
        }
        tracing::info!("注册中心后端已激活: {backend_name}");
        Ok(())
    }
}

impl Default for ExclusiveRegistryGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// 按配置构造注册中心后端（排他检查在此处收口）
pub async fn build_registry(
    config: &disched_core::config::RegistryConfig,
    guard: &ExclusiveRegistryGuard,
    hub: Arc<MemoryRegistryHub>,
) -> SchedulerResult<Arc<dyn ServerRegistry>> {
    guard.activate(&config.backend)?;
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryServerRegistry::new(
            hub,
            config.session_ttl_ms,
        ))),
        "redis" => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                SchedulerError::config_error("registry.backend=redis 时必须配置 redis_url")
            })?;
            let registry =
                RedisServerRegistry::connect(url, &config.namespace, config.session_ttl_ms).await?;
            Ok(Arc::new(registry))
        }
        other => Err(SchedulerError::config_error(format!(
            "不支持的注册中心后端: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_guard_rejects_second_backend() {
        let guard = ExclusiveRegistryGuard::new();
        assert!(guard.activate("memory").is_ok());
        let err = guard.activate("redis").unwrap_err();
        assert!(matches!(err, SchedulerError::RegistryConflict(_)));
        assert!(err.is_fatal());
    }
}
