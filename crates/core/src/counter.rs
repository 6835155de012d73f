use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::errors::SchedulerResult;

/// 单调计数器
///
/// 轮询路由的共享状态。单supervisor部署用进程内存实现；
/// 多supervisor部署用存储侧的原子自增实现（见registry crate的Redis实现），
/// 必须使用存储的原子自增原语而非读-改-写。
#[async_trait]
pub trait AtomicCounter: Send + Sync {
    async fn get(&self) -> SchedulerResult<u64>;

    async fn set(&self, value: u64) -> SchedulerResult<()>;

    /// 自增并返回自增后的值
    async fn add(&self, delta: u64) -> SchedulerResult<u64>;
}

/// 进程内存计数器
pub struct MemoryAtomicCounter {
    value: AtomicU64,
}

impl MemoryAtomicCounter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryAtomicCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AtomicCounter for MemoryAtomicCounter {
    async fn get(&self) -> SchedulerResult<u64> {
        Ok(self.value.load(Ordering::Relaxed))
    }

    async fn set(&self, value: u64) -> SchedulerResult<()> {
        self.value.store(value, Ordering::Relaxed);
        Ok(())
    }

    async fn add(&self, delta: u64) -> SchedulerResult<u64> {
        Ok(self.value.fetch_add(delta, Ordering::Relaxed) + delta)
    }
}
