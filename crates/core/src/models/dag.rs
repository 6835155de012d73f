use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{SchedulerError, SchedulerResult};

/// DAG节点，以(section, ordinal, name)三元组定位图中位置
///
/// name即该节点对应的处理器注册名；同名节点在同一表达式内视为同一节点，
/// 这使得`A -> B -> C; A -> D -> C`能表达菱形依赖。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DagNode {
    pub section: u32,
    pub ordinal: u32,
    pub name: String,
}

impl DagNode {
    pub fn new(section: u32, ordinal: u32, name: &str) -> Self {
        Self {
            section,
            ordinal,
            name: name.to_string(),
        }
    }

    fn start() -> Self {
        DagNode::new(0, 0, "Start")
    }

    fn end() -> Self {
        DagNode::new(0, 0, "End")
    }

    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.section, self.ordinal, self.name)
    }
}

impl fmt::Display for DagNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// 工作流DAG：arena存储节点，邻接集合按节点下标索引
///
/// 非循环性与连通性在任务定义时一次性校验（拓扑排序），
/// 运行期遍历不再做环防护。
#[derive(Debug, Clone)]
pub struct DagGraph {
    nodes: Vec<DagNode>,
    preds: Vec<BTreeSet<usize>>,
    succs: Vec<BTreeSet<usize>>,
    start: usize,
    end: usize,
}

impl DagGraph {
    /// 解析DAG表达式
    ///
    /// 语法：路径以`;`分隔，路径内阶段以`->`分隔，阶段内并行节点以`,`分隔。
    /// 例：`A -> B,C -> D; A -> E -> D`。
    pub fn parse(expr: &str) -> SchedulerResult<DagGraph> {
        let mut nodes = vec![DagNode::start(), DagNode::end()];
        let mut preds: Vec<BTreeSet<usize>> = vec![BTreeSet::new(), BTreeSet::new()];
        let mut succs: Vec<BTreeSet<usize>> = vec![BTreeSet::new(), BTreeSet::new()];
        let mut index: HashMap<String, usize> = HashMap::new();

        for (section_no, path) in expr.split(';').enumerate() {
            let path = path.trim();
            if path.is_empty() {
                continue;
            }
            let mut prev_stage: Vec<usize> = Vec::new();
            for stage in path.split("->") {
                let mut cur_stage = Vec::new();
                for name in stage.split(',') {
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(SchedulerError::InvalidDag(format!(
                            "表达式存在空节点名: {expr}"
                        )));
                    }
                    let id = *index.entry(name.to_string()).or_insert_with(|| {
                        nodes.push(DagNode::new(section_no as u32 + 1, 1, name));
                        preds.push(BTreeSet::new());
                        succs.push(BTreeSet::new());
                        nodes.len() - 1
                    });
                    cur_stage.push(id);
                }
                for &from in &prev_stage {
                    for &to in &cur_stage {
                        if from == to {
                            return Err(SchedulerError::InvalidDag(format!(
                                "节点自环: {}",
                                nodes[from].name
                            )));
                        }
                        succs[from].insert(to);
                        preds[to].insert(from);
                    }
                }
                prev_stage = cur_stage;
            }
        }

        if nodes.len() == 2 {
            return Err(SchedulerError::InvalidDag("表达式不含任何节点".into()));
        }

        // 无前驱的节点接到Start、无后继的节点接到End
        for id in 2..nodes.len() {
            if preds[id].is_empty() {
                succs[0].insert(id);
                preds[id].insert(0);
            }
            if succs[id].is_empty() {
                preds[1].insert(id);
                succs[id].insert(1);
            }
        }

        let graph = DagGraph {
            nodes,
            preds,
            succs,
            start: 0,
            end: 1,
        };
        graph.validate()?;
        Ok(graph)
    }

    /// 定义时校验：拓扑排序验非循环，且每个节点从Start可达、可达End
    fn validate(&self) -> SchedulerResult<()> {
        let order = self.topological_order()?;
        if order.len() != self.nodes.len() {
            return Err(SchedulerError::InvalidDag("图中存在环".into()));
        }

        let reachable = self.reachable_from(self.start);
        let coreachable = self.coreachable_to(self.end);
        for id in self.real_nodes() {
            if !reachable.contains(&id) || !coreachable.contains(&id) {
                return Err(SchedulerError::InvalidDag(format!(
                    "节点 {} 未连通到Start/End",
                    self.nodes[id].name
                )));
            }
        }
        Ok(())
    }

    fn reachable_from(&self, from: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(id) = queue.pop_front() {
            if seen.insert(id) {
                queue.extend(self.succs[id].iter().copied());
            }
        }
        seen
    }

    fn coreachable_to(&self, to: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([to]);
        while let Some(id) = queue.pop_front() {
            if seen.insert(id) {
                queue.extend(self.preds[id].iter().copied());
            }
        }
        seen
    }

    /// Kahn拓扑排序；遇环时返回的序列长度小于节点数
    pub fn topological_order(&self) -> SchedulerResult<Vec<usize>> {
        let mut indegree: Vec<usize> = self.preds.iter().map(|p| p.len()).collect();
        let mut queue: VecDeque<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &next in &self.succs[id] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(SchedulerError::InvalidDag("图中存在环".into()));
        }
        Ok(order)
    }

    pub fn node(&self, id: usize) -> &DagNode {
        &self.nodes[id]
    }

    pub fn node_by_key(&self, key: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.key() == key)
    }

    pub fn node_by_name(&self, name: &str) -> Option<usize> {
        self.real_nodes().into_iter().find(|&i| self.nodes[i].name == name)
    }

    /// 起始节点集合（仅依赖Start的节点）
    pub fn initial_nodes(&self) -> Vec<usize> {
        self.succs[self.start].iter().copied().collect()
    }

    /// 全部业务节点（排除合成的Start/End）
    pub fn real_nodes(&self) -> Vec<usize> {
        (2..self.nodes.len()).collect()
    }

    /// 业务前驱（排除Start）
    pub fn predecessors(&self, id: usize) -> Vec<usize> {
        self.preds[id]
            .iter()
            .copied()
            .filter(|&p| p != self.start)
            .collect()
    }

    /// 业务后继（排除End）
    pub fn successors(&self, id: usize) -> Vec<usize> {
        self.succs[id]
            .iter()
            .copied()
            .filter(|&s| s != self.end)
            .collect()
    }

    /// End的直接前驱：全部成功即workflow完成
    pub fn terminal_nodes(&self) -> Vec<usize> {
        self.preds[self.end].iter().copied().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len() - 2
    }
}
