use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use disched_core::errors::{SchedulerError, SchedulerResult};
use disched_core::models::DispatchPayload;

use crate::{TaskDispatcher, TaskReceiver};

/// 进程内传输：supervisor与worker同进程部署时直接走内存通道
///
/// 接收端按registry_key注册；路由结果指向未注册节点时视同不可达。
pub struct ChannelTaskDispatcher {
    receivers: RwLock<HashMap<String, Arc<dyn TaskReceiver>>>,
}

impl ChannelTaskDispatcher {
    pub fn new() -> Self {
        Self {
            receivers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_receiver(&self, registry_key: String, receiver: Arc<dyn TaskReceiver>) {
        debug!("进程内接收端注册: {registry_key}");
        self.receivers.write().await.insert(registry_key, receiver);
    }

    pub async fn deregister_receiver(&self, registry_key: &str) {
        self.receivers.write().await.remove(registry_key);
    }
}

impl Default for ChannelTaskDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskDispatcher for ChannelTaskDispatcher {
    async fn dispatch(&self, payload: &DispatchPayload) -> SchedulerResult<()> {
        let key = payload.worker.registry_key();
        let receiver = {
            let receivers = self.receivers.read().await;
            receivers.get(&key).cloned()
        };
        let Some(receiver) = receiver else {
            return Err(SchedulerError::DispatchFailed(format!(
                "Worker {key} 未注册进程内通道"
            )));
        };
        if receiver.receive(payload.clone()).await? {
            Ok(())
        } else {
            Err(SchedulerError::DispatchFailed(format!(
                "Worker {key} 容量已满拒收"
            )))
        }
    }
}
