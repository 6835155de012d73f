use std::sync::Arc;

use serde::{Deserialize, Serialize};

use disched_core::errors::{SchedulerError, SchedulerResult};
use disched_core::models::{DagGraph, Instance, Job, Task};
use disched_core::HandlerRegistry;

/// 实例附加信息（JSON持久化在Instance.attach）
///
/// workflow子实例记录DAG节点位置；重试实例在retry_type=FAILED时
/// 携带上一轮失败task的参数集合。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceAttach {
    /// DAG节点键（"section:ordinal:name"）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// 仅重试失败分片时的参数集合
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_params: Option<Vec<String>>,
    /// workflow终止失败时定位失败节点
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_node: Option<String>,
}

impl InstanceAttach {
    pub fn parse(attach: Option<&str>) -> Self {
        attach
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn encode(&self) -> SchedulerResult<Option<String>> {
        if self.node.is_none() && self.retry_params.is_none() && self.failed_node.is_none() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_string(self)?))
    }
}

/// 实例实际执行的处理器名
///
/// workflow子实例执行attach所记节点的处理器；普通实例执行job.handler。
pub fn handler_name(job: &Job, instance: &Instance) -> String {
    InstanceAttach::parse(instance.attach.as_deref())
        .node
        .and_then(|key| key.splitn(3, ':').nth(2).map(str::to_string))
        .unwrap_or_else(|| job.handler.clone())
}

/// 任务分裂器：把一次执行分解为若干task
pub struct JobSplitter {
    handlers: Arc<HandlerRegistry>,
}

impl JobSplitter {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self { handlers }
    }

    /// 分裂并生成task行（未落库、未路由）
    ///
    /// 处理器split抛错是实例级失败：调用方把实例置为FAILED，不产生task。
    pub fn split_tasks(
        &self,
        job: &Job,
        handler_name: &str,
        instance_id: i64,
    ) -> SchedulerResult<Vec<Task>> {
        let handler = self.handlers.get(handler_name)?;
        let params = handler.split(&job.group, &job.param)?;
        if params.is_empty() {
            return Err(SchedulerError::invalid_params(format!(
                "处理器 {handler_name} 分裂结果为空"
            )));
        }
        let count = params.len() as i32;
        Ok(params
            .into_iter()
            .enumerate()
            .map(|(i, param)| Task::new(instance_id, i as i32 + 1, count, param))
            .collect())
    }

    /// 按既有参数集合生成task行（重试失败分片时使用）
    pub fn tasks_from_params(&self, instance_id: i64, params: &[String]) -> Vec<Task> {
        let count = params.len() as i32;
        params
            .iter()
            .enumerate()
            .map(|(i, param)| Task::new(instance_id, i as i32 + 1, count, param.clone()))
            .collect()
    }

    /// 解析workflow任务的DAG定义（handler字段即DAG表达式）
    pub fn parse_workflow(&self, job: &Job) -> SchedulerResult<DagGraph> {
        DagGraph::parse(&job.handler)
    }

    /// 管理边界的任务定义校验：坏DAG/坏处理器引用在此同步拒绝，永不进入运行期
    pub fn verify_job(&self, job: &Job) -> SchedulerResult<()> {
        crate::trigger_time::verify_trigger(job.trigger_type, &job.trigger_value)?;
        if job.is_workflow() {
            let graph = self.parse_workflow(job)?;
            for id in graph.real_nodes() {
                let handler = self.handlers.get(&graph.node(id).name)?;
                handler.verify(&job.param)?;
            }
        } else {
            let handler = self.handlers.get(&job.handler)?;
            handler.verify(&job.param)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use disched_core::models::{JobType, RunType, TriggerType};
    use disched_core::traits::{ExecuteContext, ExecuteOutcome, JobHandler};

    /// 按逗号分裂参数的测试处理器
    struct CommaSplitHandler;

    #[async_trait]
    impl JobHandler for CommaSplitHandler {
        fn split(&self, _group: &str, param: &str) -> SchedulerResult<Vec<String>> {
            Ok(param.split(',').map(str::to_string).collect())
        }

        async fn execute(&self, _ctx: &ExecuteContext) -> SchedulerResult<ExecuteOutcome> {
            Ok(ExecuteOutcome::Finished(None))
        }
    }

    fn splitter() -> JobSplitter {
        let mut handlers = HandlerRegistry::with_builtin();
        handlers.register("comma", Arc::new(CommaSplitHandler));
        JobSplitter::new(Arc::new(handlers))
    }

    fn job(handler: &str) -> Job {
        Job::new(
            "default".into(),
            "j".into(),
            handler.into(),
            TriggerType::Cron,
            "0 * * * * *".into(),
        )
    }

    #[test]
    fn test_default_split_yields_single_task() {
        let tasks = splitter().split_tasks(&job("noop"), "noop", 7).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].instance_id, 7);
        assert_eq!((tasks[0].task_no, tasks[0].task_count), (1, 1));
    }

    #[test]
    fn test_handler_split_fans_out() {
        let mut j = job("comma");
        j.param = "a,b,c".into();
        let tasks = splitter().split_tasks(&j, "comma", 1).unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[2].param, "c");
        assert_eq!((tasks[2].task_no, tasks[2].task_count), (3, 3));
    }

    #[test]
    fn test_unknown_handler_rejected() {
        let err = splitter().split_tasks(&job("ghost"), "ghost", 1).unwrap_err();
        assert!(matches!(err, SchedulerError::HandlerNotFound { .. }));
    }

    #[test]
    fn test_verify_workflow_validates_dag_and_node_handlers() {
        let s = splitter();
        let mut j = job("noop -> sleep");
        j.job_type = JobType::Workflow;
        j.param = "10".into();
        assert!(s.verify_job(&j).is_ok());

        // 环在定义时拒绝
        j.handler = "noop -> sleep -> noop".into();
        assert!(matches!(
            s.verify_job(&j).unwrap_err(),
            SchedulerError::InvalidDag(_)
        ));

        // 未注册的节点处理器
        j.handler = "noop -> ghost".into();
        assert!(matches!(
            s.verify_job(&j).unwrap_err(),
            SchedulerError::HandlerNotFound { .. }
        ));
    }

    #[test]
    fn test_attach_round_trip_and_handler_resolution() {
        let attach = InstanceAttach {
            node: Some("1:1:sleep".into()),
            ..Default::default()
        };
        let encoded = attach.encode().unwrap().unwrap();

        let j = job("noop -> sleep");
        let mut inst = Instance::new(1, chrono::Utc::now(), RunType::Depend);
        inst.attach = Some(encoded);
        assert_eq!(handler_name(&j, &inst), "sleep");

        // 无attach时回退到job.handler
        let plain = Instance::new(1, chrono::Utc::now(), RunType::Scheduled);
        assert_eq!(handler_name(&job("noop"), &plain), "noop");

        // 空attach编码为None而非"{}"
        assert_eq!(InstanceAttach::default().encode().unwrap(), None);
    }
}
