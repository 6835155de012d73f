use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use disched_core::errors::SchedulerResult;
use disched_core::models::{ServerIdentity, ServerRole};

use crate::ServerRegistry;

/// 共享的成员表：`(role, registry_key) -> 会话过期时间`
///
/// 模拟存储轮询型注册中心：注册/续约写入带TTL的时间戳行，
/// 发现时过滤掉已过期条目——失败检测依靠缺席，而非主动注销。
/// 单进程同时跑supervisor与worker时共享同一个hub即可互相发现。
pub struct MemoryRegistryHub {
    entries: RwLock<HashMap<(ServerRole, String), DateTime<Utc>>>,
}

impl MemoryRegistryHub {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRegistryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// 内存TTL后端（参考实现）
pub struct MemoryServerRegistry {
    hub: Arc<MemoryRegistryHub>,
    session_ttl_ms: u64,
}

impl MemoryServerRegistry {
    pub fn new(hub: Arc<MemoryRegistryHub>, session_ttl_ms: u64) -> Self {
        Self { hub, session_ttl_ms }
    }

    fn expiry(&self) -> DateTime<Utc> {
        Utc::now() + Duration::milliseconds(self.session_ttl_ms as i64)
    }
}

#[async_trait]
impl ServerRegistry for MemoryServerRegistry {
    async fn register(&self, role: ServerRole, identity: &ServerIdentity) -> SchedulerResult<()> {
        let mut entries = self.hub.entries.write().await;
        entries.insert((role, identity.registry_key()), self.expiry());
        debug!("注册 {} 为 {}", identity, role.as_str());
        Ok(())
    }

    async fn renew(&self, role: ServerRole, identity: &ServerIdentity) -> SchedulerResult<()> {
        let mut entries = self.hub.entries.write().await;
        entries.insert((role, identity.registry_key()), self.expiry());
        Ok(())
    }

    async fn deregister(&self, role: ServerRole, identity: &ServerIdentity) -> SchedulerResult<()> {
        let mut entries = self.hub.entries.write().await;
        entries.remove(&(role, identity.registry_key()));
        Ok(())
    }

    async fn discover(
        &self,
        role: ServerRole,
        group: &str,
    ) -> SchedulerResult<Vec<ServerIdentity>> {
        let now = Utc::now();
        let entries = self.hub.entries.read().await;
        let mut alive: Vec<ServerIdentity> = entries
            .iter()
            .filter(|((r, _), expiry)| *r == role && **expiry > now)
            .filter_map(|((_, key), _)| ServerIdentity::parse_registry_key(key))
            .filter(|id| group.is_empty() || id.group == group)
            .collect();
        alive.sort_by_key(|id| id.registry_key());
        Ok(alive)
    }

    async fn close(&self) -> SchedulerResult<()> {
        Ok(())
    }
}
