use serde::{Deserialize, Serialize};

/// 分组配置快照
///
/// 读多写少，从持久存储周期性刷新；用于鉴权跨角色RPC并路由告警。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub owner: String,
    pub dev_users: Vec<String>,
    pub alert_recipients: Vec<String>,
    pub webhook: Option<String>,
    /// Worker侧RPC共享密钥
    pub worker_token: String,
    /// Supervisor侧凭据，worker汇报时回带
    pub supervisor_token: String,
}

impl Group {
    pub fn new(name: &str, owner: &str) -> Self {
        Self {
            name: name.to_string(),
            owner: owner.to_string(),
            dev_users: Vec::new(),
            alert_recipients: Vec::new(),
            webhook: None,
            worker_token: uuid::Uuid::new_v4().to_string(),
            supervisor_token: uuid::Uuid::new_v4().to_string(),
        }
    }
}
