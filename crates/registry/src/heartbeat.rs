use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use disched_core::models::{ServerIdentity, ServerRole};

use crate::ServerRegistry;

/// 启动会话保活循环
///
/// 先同步完成首次注册，随后在后台以TTL/3的间隔续约——即使丢失一次
/// 心跳，会话仍有两次续约机会才会过期。收到关闭信号后主动注销。
pub async fn spawn_session_keeper(
    registry: Arc<dyn ServerRegistry>,
    role: ServerRole,
    identity: ServerIdentity,
    renew_interval_ms: u64,
    mut shutdown: broadcast::Receiver<()>,
) -> disched_core::errors::SchedulerResult<JoinHandle<()>> {
    registry.register(role, &identity).await?;
    info!("{} {} 已注册，续约间隔 {}ms", role.as_str(), identity, renew_interval_ms);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(renew_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match registry.renew(role, &identity).await {
                        Ok(()) => debug!("{} 会话续约成功", identity),
                        // 单次失败不退出：注册中心抖动时靠下一个周期补救
                        Err(e) => warn!("{} 会话续约失败: {e}", identity),
                    }
                }
                _ = shutdown.recv() => {
                    if let Err(e) = registry.deregister(role, &identity).await {
                        warn!("{} 注销失败: {e}", identity);
                    }
                    info!("{} 会话保活循环退出", identity);
                    break;
                }
            }
        }
    });
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRegistryHub, MemoryServerRegistry};

    #[tokio::test]
    async fn test_keeper_registers_then_deregisters_on_shutdown() {
        let hub = Arc::new(MemoryRegistryHub::new());
        let registry: Arc<dyn ServerRegistry> =
            Arc::new(MemoryServerRegistry::new(hub, 30_000));
        let identity = ServerIdentity::new("g1", "w1", "127.0.0.1", 8200);
        let (tx, rx) = broadcast::channel(1);

        let handle = spawn_session_keeper(
            registry.clone(),
            ServerRole::Worker,
            identity.clone(),
            10_000,
            rx,
        )
        .await
        .unwrap();

        let found = registry.discover(ServerRole::Worker, "g1").await.unwrap();
        assert_eq!(found.len(), 1);

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(registry
            .discover(ServerRole::Worker, "g1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_keeper_renews_expiring_session() {
        let hub = Arc::new(MemoryRegistryHub::new());
        // 短TTL，续约间隔TTL/3：只要循环在跑，条目就一直存活
        let registry: Arc<dyn ServerRegistry> =
            Arc::new(MemoryServerRegistry::new(hub, 90));
        let identity = ServerIdentity::new("g1", "w1", "127.0.0.1", 8200);
        let (tx, rx) = broadcast::channel(1);

        let handle = spawn_session_keeper(
            registry.clone(),
            ServerRole::Worker,
            identity.clone(),
            30,
            rx,
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let found = registry.discover(ServerRole::Worker, "g1").await.unwrap();
        assert_eq!(found.len(), 1, "续约应维持会话存活超过单个TTL");

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
