use serde::{Deserialize, Serialize};
use std::fmt;

/// 集群角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ServerRole {
    #[serde(rename = "SUPERVISOR")]
    Supervisor,
    #[serde(rename = "WORKER")]
    Worker,
}

impl ServerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerRole::Supervisor => "supervisor",
            ServerRole::Worker => "worker",
        }
    }
}

/// 服务器/Worker身份
///
/// 同一台物理服务器可承载同分组内多个逻辑Worker，因此区分两级相等性：
/// group+host+port相同即为"同一服务器"，再加worker_id相同才是"同一Worker"。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServerIdentity {
    pub group: String,
    pub worker_id: String,
    pub host: String,
    pub port: u16,
}

impl ServerIdentity {
    pub fn new(group: &str, worker_id: &str, host: &str, port: u16) -> Self {
        Self {
            group: group.to_string(),
            worker_id: worker_id.to_string(),
            host: host.to_string(),
            port,
        }
    }

    pub fn same_server(&self, other: &ServerIdentity) -> bool {
        self.group == other.group && self.host == other.host && self.port == other.port
    }

    pub fn same_worker(&self, other: &ServerIdentity) -> bool {
        self.same_server(other) && self.worker_id == other.worker_id
    }

    /// 注册中心条目名：`{group}:{host}:{port}:{worker_id}`
    pub fn registry_key(&self) -> String {
        format!("{}:{}:{}:{}", self.group, self.host, self.port, self.worker_id)
    }

    pub fn parse_registry_key(key: &str) -> Option<ServerIdentity> {
        let mut parts = key.splitn(4, ':');
        let group = parts.next()?;
        let host = parts.next()?;
        let port = parts.next()?.parse().ok()?;
        let worker_id = parts.next()?;
        Some(ServerIdentity::new(group, worker_id, host, port))
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}#{}", self.group, self.host, self.port, self.worker_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_server_vs_same_worker() {
        let a = ServerIdentity::new("g1", "w1", "10.0.0.1", 8081);
        let b = ServerIdentity::new("g1", "w2", "10.0.0.1", 8081);
        let c = ServerIdentity::new("g2", "w1", "10.0.0.1", 8081);

        assert!(a.same_server(&b));
        assert!(!a.same_worker(&b));
        assert!(a.same_worker(&a.clone()));
        // 分组不同则两级相等性均不成立，即便host/port/worker_id一致
        assert!(!a.same_server(&c));
        assert!(!a.same_worker(&c));
    }

    #[test]
    fn test_registry_key_round_trip() {
        let id = ServerIdentity::new("default", "w-01", "192.168.1.5", 9000);
        let parsed = ServerIdentity::parse_registry_key(&id.registry_key()).unwrap();
        assert!(id.same_worker(&parsed));
        assert_eq!(id, parsed);
    }
}
