//! 运行状态模型
//!
//! 一次批改运行从提交到结束的完整生命周期数据，
//! 展示层通过轮询拿到它的快照。

use serde::Serialize;
use std::collections::BTreeMap;

use crate::model::{ItemResult, UsageTotals};

/// 运行状态机
///
/// `queued → running → ok | partial | failed | empty`，
/// 终态一经写入不再变化。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// 已入队，调度器尚未启动
    Queued,
    /// 批改进行中
    Running,
    /// 全部成功
    Ok,
    /// 部分失败
    Partial,
    /// 全部失败（或批次级异常）
    Failed,
    /// 批次为空，没有可处理的文件
    Empty,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Empty => "empty",
        };
        f.write_str(s)
    }
}

/// 单个失败条目的摘要
#[derive(Debug, Clone, Serialize)]
pub struct RunItemError {
    pub index: usize,
    pub message: String,
}

/// 一次运行的实时状态
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: String,
    pub status: RunStatus,
    pub total: usize,
    pub completed: usize,
    /// 仅累计成功条目的 token 用量
    pub aggregate: UsageTotals,
    pub results: BTreeMap<usize, ItemResult>,
    pub errors: Vec<RunItemError>,
    /// 相对输出根目录的运行目录
    pub run_path: String,
    /// 批次级错误（单条失败不写这里）
    pub error: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
}

impl RunState {
    pub fn new(run_id: String, total: usize, run_path: String) -> Self {
        Self {
            run_id,
            status: RunStatus::Queued,
            total,
            completed: 0,
            aggregate: UsageTotals::default(),
            results: BTreeMap::new(),
            errors: Vec::new(),
            run_path,
            error: None,
            created_at: timestamp_now(),
            finished_at: None,
        }
    }

    /// 记录一个到达终态的条目
    ///
    /// 完成计数加一；成功条目的用量并入聚合，失败条目进入错误列表。
    pub fn record_item(&mut self, result: ItemResult) {
        self.completed += 1;
        if result.is_success() {
            self.aggregate.add(&result.usage());
        } else if let Some(message) = &result.error {
            self.errors.push(RunItemError {
                index: result.index,
                message: message.clone(),
            });
        }
        self.results.insert(result.index, result);
    }

    /// 写入终态
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed = self.total;
        self.finished_at = Some(timestamp_now());
    }

    /// 批次级失败（调度器本身出错，而非单条失败）
    pub fn fail(&mut self, message: String) {
        self.status = RunStatus::Failed;
        self.error = Some(message);
        self.finished_at = Some(timestamp_now());
    }

    /// 供展示层使用的快照，结果按条目序号排序
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            status: self.status,
            total: self.total,
            completed: self.completed,
            aggregate: self.aggregate,
            results: self.results.values().cloned().collect(),
            errors: self.errors.clone(),
            run_path: self.run_path.clone(),
            error: self.error.clone(),
            created_at: self.created_at.clone(),
            finished_at: self.finished_at.clone(),
        }
    }
}

/// 展示层轮询得到的运行快照
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub total: usize,
    pub completed: usize,
    pub aggregate: UsageTotals,
    pub results: Vec<ItemResult>,
    pub errors: Vec<RunItemError>,
    pub run_path: String,
    pub error: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
}

/// 秒级精度的本地时间戳
pub fn timestamp_now() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StageUsage;

    fn ok_item(index: usize) -> ItemResult {
        ItemResult {
            index,
            original: format!("essay_{}.png", index),
            saved: Some(format!("run/essay_{}.png", index)),
            report: Some(format!("run/essay_{}_report.md", index)),
            vlm_usage: StageUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
            llm_usage: StageUsage {
                prompt_tokens: 20,
                completion_tokens: 15,
            },
            logs: vec![],
            error: None,
        }
    }

    fn failed_item(index: usize) -> ItemResult {
        ItemResult {
            index,
            original: format!("essay_{}.png", index),
            saved: None,
            report: None,
            vlm_usage: StageUsage::default(),
            llm_usage: StageUsage::default(),
            logs: vec![],
            error: Some("模拟失败".to_string()),
        }
    }

    #[test]
    fn test_record_item_aggregates_only_successes() {
        let mut state = RunState::new("r1".to_string(), 3, "r1".to_string());
        state.record_item(ok_item(0));
        state.record_item(failed_item(1));
        state.record_item(ok_item(2));

        assert_eq!(state.completed, 3);
        assert_eq!(state.errors.len(), 1);
        assert_eq!(state.aggregate.vlm_input, 20);
        assert_eq!(state.aggregate.llm_output, 30);
    }

    #[test]
    fn test_snapshot_orders_results_by_index() {
        let mut state = RunState::new("r1".to_string(), 3, "r1".to_string());
        state.record_item(ok_item(2));
        state.record_item(ok_item(0));
        state.record_item(ok_item(1));

        let snapshot = state.snapshot();
        let indices: Vec<usize> = snapshot.results.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Ok.is_terminal());
        assert!(RunStatus::Partial.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Empty.is_terminal());
    }

    #[test]
    fn test_finish_stamps_time_and_completion() {
        let mut state = RunState::new("r1".to_string(), 2, "r1".to_string());
        state.record_item(ok_item(0));
        state.record_item(failed_item(1));
        state.finish(RunStatus::Partial);

        assert_eq!(state.status, RunStatus::Partial);
        assert_eq!(state.completed, 2);
        assert!(state.finished_at.is_some());
    }
}
