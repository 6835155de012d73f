use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use disched_core::counter::AtomicCounter;
use disched_core::errors::{SchedulerError, SchedulerResult};
use disched_core::models::{ServerIdentity, ServerRole};

use crate::ServerRegistry;

fn registry_error(err: redis::RedisError) -> SchedulerError {
    SchedulerError::RegistryUnavailable(err.to_string())
}

/// Redis后端：key TTL充当注册会话
///
/// 条目键：`{namespace}:{role}:{registry_key}`，值为注册时间。
/// 崩溃进程停止续约后，键在一个TTL周期内自然过期。
pub struct RedisServerRegistry {
    conn: ConnectionManager,
    namespace: String,
    session_ttl_ms: u64,
}

impl RedisServerRegistry {
    pub async fn connect(url: &str, namespace: &str, session_ttl_ms: u64) -> SchedulerResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| SchedulerError::config_error(format!("Redis地址无效: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(registry_error)?;
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
            session_ttl_ms,
        })
    }

    fn session_key(&self, role: ServerRole, identity: &ServerIdentity) -> String {
        format!("{}:{}:{}", self.namespace, role.as_str(), identity.registry_key())
    }

    fn discover_pattern(&self, role: ServerRole, group: &str) -> String {
        if group.is_empty() {
            format!("{}:{}:*", self.namespace, role.as_str())
        } else {
            format!("{}:{}:{}:*", self.namespace, role.as_str(), group)
        }
    }

    async fn put_session(&self, key: &str) -> SchedulerResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(chrono::Utc::now().timestamp_millis())
            .arg("PX")
            .arg(self.session_ttl_ms)
            .query_async::<()>(&mut conn)
            .await
            .map_err(registry_error)
    }
}

#[async_trait]
impl ServerRegistry for RedisServerRegistry {
    async fn register(&self, role: ServerRole, identity: &ServerIdentity) -> SchedulerResult<()> {
        let key = self.session_key(role, identity);
        self.put_session(&key).await?;
        debug!("注册 {} 为 {}", identity, role.as_str());
        Ok(())
    }

    async fn renew(&self, role: ServerRole, identity: &ServerIdentity) -> SchedulerResult<()> {
        self.put_session(&self.session_key(role, identity)).await
    }

    async fn deregister(&self, role: ServerRole, identity: &ServerIdentity) -> SchedulerResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(self.session_key(role, identity))
            .query_async::<()>(&mut conn)
            .await
            .map_err(registry_error)
    }

    async fn discover(
        &self,
        role: ServerRole,
        group: &str,
    ) -> SchedulerResult<Vec<ServerIdentity>> {
        let mut conn = self.conn.clone();
        let prefix = format!("{}:{}:", self.namespace, role.as_str());
        let pattern = self.discover_pattern(role, group);
        // SCAN游标遍历，不用KEYS：注册表与业务共用Redis时不可阻塞全库
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(registry_error)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        let mut alive: Vec<ServerIdentity> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(ServerIdentity::parse_registry_key)
            .collect();
        alive.sort_by_key(|id| id.registry_key());
        Ok(alive)
    }

    async fn close(&self) -> SchedulerResult<()> {
        Ok(())
    }
}

/// 存储侧原子计数器：INCRBY保证多supervisor并发下的轮询公平性
///
/// 每次自增后顺带续约键TTL，防止计数器在运行中静默过期。
pub struct RedisAtomicCounter {
    conn: ConnectionManager,
    key: String,
    ttl_ms: u64,
}

impl RedisAtomicCounter {
    pub async fn connect(url: &str, key: &str, ttl_ms: u64) -> SchedulerResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| SchedulerError::config_error(format!("Redis地址无效: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(registry_error)?;
        Ok(Self {
            conn,
            key: key.to_string(),
            ttl_ms,
        })
    }
}

#[async_trait]
impl AtomicCounter for RedisAtomicCounter {
    async fn get(&self) -> SchedulerResult<u64> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = redis::cmd("GET")
            .arg(&self.key)
            .query_async(&mut conn)
            .await
            .map_err(registry_error)?;
        Ok(value.unwrap_or(0))
    }

    async fn set(&self, value: u64) -> SchedulerResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(&self.key)
            .arg(value)
            .arg("PX")
            .arg(self.ttl_ms)
            .query_async::<()>(&mut conn)
            .await
            .map_err(registry_error)
    }

    async fn add(&self, delta: u64) -> SchedulerResult<u64> {
        let mut conn = self.conn.clone();
        // 必须用存储的原子自增原语，读-改-写在并发supervisor下不正确
        let value: u64 = redis::cmd("INCRBY")
            .arg(&self.key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(registry_error)?;
        if let Err(e) = redis::cmd("PEXPIRE")
            .arg(&self.key)
            .arg(self.ttl_ms)
            .query_async::<()>(&mut conn)
            .await
        {
            warn!("计数器TTL续约失败: {e}");
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_namespacing() {
        // 仅校验键布局，不依赖Redis进程
        let id = ServerIdentity::new("etl", "w1", "10.0.0.1", 8200);
        let key = format!("disched:{}:{}", ServerRole::Worker.as_str(), id.registry_key());
        assert_eq!(key, "disched:worker:etl:10.0.0.1:8200:w1");
        let parsed = ServerIdentity::parse_registry_key(
            key.strip_prefix("disched:worker:").unwrap(),
        )
        .unwrap();
        assert!(parsed.same_worker(&id));
    }
}
