use serde::Serialize;

use crate::model::usage::{StageUsage, UsageTotals};

/// 单个文件的处理结果
///
/// `error` 为 `None` 即成功；成功与失败恰好填充其一，
/// 两个阶段的用量只在成功时非零。
#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    /// 在本次运行中的序号（从 0 开始，与提交顺序一致）
    pub index: usize,
    /// 原始文件名
    pub original: String,
    /// 运行目录内的暂存文件名（提交阶段失败时为 None）
    pub saved: Option<String>,
    /// 报告文件名（仅成功时存在）
    pub report: Option<String>,
    pub vlm_usage: StageUsage,
    pub llm_usage: StageUsage,
    /// 该文件的处理日志
    pub logs: Vec<String>,
    /// 失败时的分类错误描述
    pub error: Option<String>,
}

impl ItemResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// 本条目的用量增量
    pub fn usage(&self) -> UsageTotals {
        UsageTotals::from_stages(self.vlm_usage, self.llm_usage)
    }
}
