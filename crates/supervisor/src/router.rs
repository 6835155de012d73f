use std::collections::BTreeMap;
use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use disched_core::counter::AtomicCounter;
use disched_core::errors::{SchedulerError, SchedulerResult};
use disched_core::models::{RouteStrategy, ServerIdentity, Task};

/// 每个Worker在哈希环上的虚拟节点数，用于摊平负载
const VIRTUAL_NODES: u32 = 128;

/// 执行路由器：把每个task指派到恰好一个存活Worker
///
/// 轮询计数器是显式注入的对象：单supervisor部署用进程内计数器，
/// 多副本部署换成存储侧原子自增实现即可保证集群级公平。
pub struct ExecutionRouter {
    counter: Arc<dyn AtomicCounter>,
    /// 本supervisor身份，LOCAL_PRIORITY用于同机优先判定
    local: ServerIdentity,
}

impl ExecutionRouter {
    pub fn new(counter: Arc<dyn AtomicCounter>, local: ServerIdentity) -> Self {
        Self { counter, local }
    }

    /// 就地指派tasks的worker字段
    ///
    /// 空的存活Worker集合是可重试的路由失败，调用方下一轮扫描重试。
    pub async fn route(
        &self,
        strategy: RouteStrategy,
        tasks: &mut [Task],
        workers: &[ServerIdentity],
    ) -> SchedulerResult<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        if workers.is_empty() {
            return Err(SchedulerError::NoAvailableWorker(
                "存活Worker集合为空".to_string(),
            ));
        }
        match strategy {
            RouteStrategy::RoundRobin => self.round_robin(tasks, workers).await,
            RouteStrategy::Random => {
                let mut rng = rand::rng();
                for task in tasks.iter_mut() {
                    let idx = rng.random_range(0..workers.len());
                    task.worker = Some(workers[idx].clone());
                }
                Ok(())
            }
            RouteStrategy::ConsistentHash => {
                let ring = build_ring(workers);
                for task in tasks.iter_mut() {
                    let slot = ring_lookup(&ring, fnv1a64(task.id.to_string().as_bytes()));
                    task.worker = Some(workers[slot].clone());
                }
                Ok(())
            }
            RouteStrategy::LocalPriority => {
                // 同机（group+host+port一致）优先，无同机Worker时回退轮询
                if let Some(colocated) = workers.iter().find(|w| w.same_server(&self.local)) {
                    debug!("本机优先路由命中: {colocated}");
                    for task in tasks.iter_mut() {
                        task.worker = Some(colocated.clone());
                    }
                    Ok(())
                } else {
                    self.round_robin(tasks, workers).await
                }
            }
        }
    }

    async fn round_robin(
        &self,
        tasks: &mut [Task],
        workers: &[ServerIdentity],
    ) -> SchedulerResult<()> {
        let end = self.counter.add(tasks.len() as u64).await?;
        let start = end - tasks.len() as u64;
        for (i, task) in tasks.iter_mut().enumerate() {
            let idx = ((start + i as u64) % workers.len() as u64) as usize;
            task.worker = Some(workers[idx].clone());
        }
        Ok(())
    }
}

/// 构造哈希环：位置 -> workers下标
fn build_ring(workers: &[ServerIdentity]) -> BTreeMap<u64, usize> {
    let mut ring = BTreeMap::new();
    for (idx, worker) in workers.iter().enumerate() {
        for v in 0..VIRTUAL_NODES {
            let position = fnv1a64(format!("{}#{v}", worker.registry_key()).as_bytes());
            ring.insert(position, idx);
        }
    }
    ring
}

/// 顺时针取第一个位置；越过环尾回绕到环首
fn ring_lookup(ring: &BTreeMap<u64, usize>, hash: u64) -> usize {
    ring.range(hash..)
        .next()
        .or_else(|| ring.iter().next())
        .map(|(_, &idx)| idx)
        .unwrap_or(0)
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use disched_core::counter::MemoryAtomicCounter;

    fn router() -> ExecutionRouter {
        ExecutionRouter::new(
            Arc::new(MemoryAtomicCounter::new()),
            ServerIdentity::new("default", "sup-1", "10.0.0.1", 8100),
        )
    }

    fn workers(n: usize) -> Vec<ServerIdentity> {
        (0..n)
            .map(|i| ServerIdentity::new("default", &format!("w{i}"), &format!("10.0.1.{i}"), 8200))
            .collect()
    }

    fn tasks(n: usize) -> Vec<Task> {
        (0..n)
            .map(|i| {
                let mut t = Task::new(1, i as i32 + 1, n as i32, String::new());
                t.id = i as i64 + 1;
                t
            })
            .collect()
    }

    #[tokio::test]
    async fn test_empty_worker_set_is_retryable_failure() {
        let mut ts = tasks(2);
        let err = router()
            .route(RouteStrategy::RoundRobin, &mut ts, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NoAvailableWorker(_)));
        assert!(err.is_retryable());
        assert!(ts.iter().all(|t| t.worker.is_none()));
    }

    #[tokio::test]
    async fn test_round_robin_cycles_fairly() {
        let r = router();
        let ws = workers(3);
        let mut ts = tasks(9);
        r.route(RouteStrategy::RoundRobin, &mut ts, &ws).await.unwrap();
        let mut counts = std::collections::HashMap::new();
        for t in &ts {
            let id = t.worker.as_ref().unwrap().worker_id.clone();
            *counts.entry(id).or_insert(0) += 1;
        }
        assert!(counts.values().all(|&c| c == 3), "轮询应均匀分配: {counts:?}");
    }

    #[tokio::test]
    async fn test_consistent_hash_is_deterministic() {
        let r = router();
        let ws = workers(4);
        let mut first = tasks(20);
        let mut second = tasks(20);
        r.route(RouteStrategy::ConsistentHash, &mut first, &ws).await.unwrap();
        r.route(RouteStrategy::ConsistentHash, &mut second, &ws).await.unwrap();
        for (a, b) in first.iter().zip(second.iter()) {
            assert!(a.worker.as_ref().unwrap().same_worker(b.worker.as_ref().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_consistent_hash_stability_under_membership_change() {
        let r = router();
        let before = workers(4);
        // 去掉一个成员，其余不变
        let after: Vec<ServerIdentity> = before[..3].to_vec();

        let mut routed_before = tasks(200);
        let mut routed_after = tasks(200);
        r.route(RouteStrategy::ConsistentHash, &mut routed_before, &before)
            .await
            .unwrap();
        r.route(RouteStrategy::ConsistentHash, &mut routed_after, &after)
            .await
            .unwrap();

        let moved = routed_before
            .iter()
            .zip(routed_after.iter())
            .filter(|(a, b)| {
                !a.worker.as_ref().unwrap().same_worker(b.worker.as_ref().unwrap())
            })
            .count();
        // 只有环邻域变化的task被改派，不是全量
        assert!(moved > 0);
        assert!(moved < 200, "成员变化不应导致全量改派");
        // 留在幸存Worker上的task不应移动
        for (a, b) in routed_before.iter().zip(routed_after.iter()) {
            let wa = a.worker.as_ref().unwrap();
            if wa.same_worker(&before[3]) {
                continue;
            }
            assert!(wa.same_worker(b.worker.as_ref().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_local_priority_prefers_colocated_worker() {
        let r = router();
        let mut ws = workers(3);
        // 与supervisor同机的Worker（group+host+port一致，worker_id不同）
        ws.push(ServerIdentity::new("default", "w-local", "10.0.0.1", 8100));
        let mut ts = tasks(5);
        r.route(RouteStrategy::LocalPriority, &mut ts, &ws).await.unwrap();
        assert!(ts
            .iter()
            .all(|t| t.worker.as_ref().unwrap().worker_id == "w-local"));
    }

    #[tokio::test]
    async fn test_local_priority_falls_back_to_round_robin() {
        let r = router();
        let ws = workers(2);
        let mut ts = tasks(4);
        r.route(RouteStrategy::LocalPriority, &mut ts, &ws).await.unwrap();
        assert!(ts.iter().all(|t| t.worker.is_some()));
        let distinct: std::collections::HashSet<String> = ts
            .iter()
            .map(|t| t.worker.as_ref().unwrap().worker_id.clone())
            .collect();
        assert_eq!(distinct.len(), 2);
    }

    #[tokio::test]
    async fn test_random_assigns_every_task() {
        let r = router();
        let ws = workers(3);
        let mut ts = tasks(10);
        r.route(RouteStrategy::Random, &mut ts, &ws).await.unwrap();
        assert!(ts.iter().all(|t| t.worker.is_some()));
    }
}
