use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{SchedulerError, SchedulerResult};
use crate::models::TaskReport;

/// 任务执行上下文
///
/// `cancel_flag`是协作式取消点：PAUSE/CANCEL到达后由框架置位，
/// 处理器应在安全点检查并以对应的Outcome退出，而非抛错。
pub struct ExecuteContext {
    pub task_id: i64,
    pub instance_id: i64,
    pub task_no: i32,
    pub task_count: i32,
    pub param: String,
    cancel_flag: Arc<AtomicBool>,
}

impl ExecuteContext {
    pub fn new(
        task_id: i64,
        instance_id: i64,
        task_no: i32,
        task_count: i32,
        param: String,
        cancel_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            task_id,
            instance_id,
            task_no,
            task_count,
            param,
            cancel_flag,
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::Acquire)
    }

    /// 处理器在安全点调用：取消已请求时返回Canceled结果
    pub fn checkpoint(&self) -> Option<ExecuteOutcome> {
        if self.is_cancel_requested() {
            Some(ExecuteOutcome::Canceled)
        } else {
            None
        }
    }
}

/// 执行结果
///
/// 暂停/取消是显式的控制流变体而非异常，不消耗重试预算。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Finished(Option<String>),
    Paused,
    Canceled,
}

/// 任务处理器
///
/// `split`在supervisor侧被调用用于分裂job，`execute`在worker侧运行。
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// 校验param合法性（不执行）
    fn verify(&self, _param: &str) -> SchedulerResult<()> {
        Ok(())
    }

    /// 把job参数分裂为若干task参数；默认单task
    fn split(&self, _group: &str, param: &str) -> SchedulerResult<Vec<String>> {
        Ok(vec![param.to_string()])
    }

    async fn execute(&self, ctx: &ExecuteContext) -> SchedulerResult<ExecuteOutcome>;
}

impl std::fmt::Debug for dyn JobHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JobHandler")
    }
}

/// Worker向supervisor的执行汇报通道
#[async_trait]
pub trait TaskReporter: Send + Sync {
    async fn report(&self, report: TaskReport) -> SchedulerResult<()>;
}

/// 内置：空处理器（联调与测试）
pub struct NoopHandler;

#[async_trait]
impl JobHandler for NoopHandler {
    async fn execute(&self, ctx: &ExecuteContext) -> SchedulerResult<ExecuteOutcome> {
        if let Some(outcome) = ctx.checkpoint() {
            return Ok(outcome);
        }
        Ok(ExecuteOutcome::Finished(Some(format!(
            "noop:{}/{}",
            ctx.task_no, ctx.task_count
        ))))
    }
}

/// 内置：按param毫秒数睡眠，期间周期性检查取消点
pub struct SleepHandler;

#[async_trait]
impl JobHandler for SleepHandler {
    fn verify(&self, param: &str) -> SchedulerResult<()> {
        param
            .trim()
            .parse::<u64>()
            .map(|_| ())
            .map_err(|_| SchedulerError::InvalidParams(format!("sleep毫秒数无效: {param}")))
    }

    async fn execute(&self, ctx: &ExecuteContext) -> SchedulerResult<ExecuteOutcome> {
        let total_ms: u64 = ctx
            .param
            .trim()
            .parse()
            .map_err(|_| SchedulerError::InvalidParams(format!("sleep毫秒数无效: {}", ctx.param)))?;
        let mut remained = total_ms;
        while remained > 0 {
            if let Some(outcome) = ctx.checkpoint() {
                return Ok(outcome);
            }
            let step = remained.min(50);
            tokio::time::sleep(std::time::Duration::from_millis(step)).await;
            remained -= step;
        }
        Ok(ExecuteOutcome::Finished(Some(format!("slept {total_ms}ms"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(param: &str, flag: Arc<AtomicBool>) -> ExecuteContext {
        ExecuteContext::new(1, 1, 1, 1, param.to_string(), flag)
    }

    #[tokio::test]
    async fn test_noop_handler_finishes() {
        let outcome = NoopHandler
            .execute(&ctx("", Arc::new(AtomicBool::new(false))))
            .await
            .unwrap();
        assert!(matches!(outcome, ExecuteOutcome::Finished(Some(_))));
    }

    #[tokio::test]
    async fn test_cancel_flag_yields_canceled_outcome() {
        let flag = Arc::new(AtomicBool::new(false));
        let c = ctx("10000", flag.clone());
        let handle = tokio::spawn(async move { SleepHandler.execute(&c).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        flag.store(true, Ordering::Release);
        let outcome = handle.await.unwrap().unwrap();
        // 取消是控制流结果，不是错误
        assert_eq!(outcome, ExecuteOutcome::Canceled);
    }

    #[test]
    fn test_default_split_is_single_task() {
        let parts = NoopHandler.split("default", "p").unwrap();
        assert_eq!(parts, vec!["p".to_string()]);
    }

    #[test]
    fn test_sleep_handler_verify() {
        assert!(SleepHandler.verify("100").is_ok());
        assert!(SleepHandler.verify("abc").is_err());
    }
}
