//! 作文批改流程 - 流程层
//!
//! 核心职责：定义"一篇作文"的完整处理流程
//!
//! 流程顺序：
//! 1. VLM 识别手写文本 + 书写打分（带重试）
//! 2. 敏感度指数变换
//! 3. LLM 生成批改报告（带重试）
//! 4. 报告落盘 + 全局 token 用量累计

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::RunSettings;
use crate::error::{AppError, AppResult};
use crate::infrastructure::{ConfigStore, ProgressSender};
use crate::model::{ItemResult, StageUsage, UsageTotals};
use crate::services::{apply_sensitivity, LlmService, VlmService};
use crate::utils::logging::truncate_text;
use crate::workflow::essay_task::{RunCtx, TaskItem};
use crate::workflow::retry::{retry_with_backoff, RetryPolicy};

/// 单篇作文的处理器
///
/// 调度器只通过该接口驱动任务，测试中可以换成不访问网络的假实现。
pub trait ItemProcessor: Send + Sync {
    /// 处理一篇作文并返回终态结果（成功与失败都体现在结果里，不抛错）
    fn process(
        &self,
        ctx: &RunCtx,
        item: &TaskItem,
        progress: &ProgressSender,
    ) -> impl Future<Output = ItemResult> + Send;
}

/// 作文批改流程
///
/// - 编排"识别 → 变换 → 批改 → 落盘 → 计量"的完整顺序
/// - 决定每个阶段何时重试、何时放弃
/// - 不关心并发和批次，只看一篇作文
pub struct EssayFlow {
    vlm: VlmService,
    llm: LlmService,
    retry: RetryPolicy,
    sensitivity_factor: f64,
    store: Arc<ConfigStore>,
}

impl EssayFlow {
    pub fn new(settings: &RunSettings, store: Arc<ConfigStore>) -> Self {
        Self {
            vlm: VlmService::new(settings),
            llm: LlmService::new(settings),
            retry: RetryPolicy::from_settings(settings),
            sensitivity_factor: settings.sensitivity_factor,
            store,
        }
    }

    /// 两阶段流水线；任一阶段耗尽重试或遇到永久错误即失败
    async fn grade_essay(
        &self,
        ctx: &RunCtx,
        item: &TaskItem,
        progress: &ProgressSender,
        logs: &mut Vec<String>,
        vlm_usage: &mut StageUsage,
        llm_usage: &mut StageUsage,
    ) -> AppResult<()> {
        // ========== 阶段 1: VLM 识别 ==========
        info!("{} 🔍 VLM 识别中: {}", item, item.original_name);
        let analysis = retry_with_backoff(&self.retry, |attempt| {
            if attempt > 0 {
                progress.log(format!(
                    "{} VLM 第 {}/{} 次尝试",
                    item,
                    attempt + 1,
                    self.retry.max_attempts
                ));
            }
            self.vlm.analyze_image(&item.image_path)
        })
        .await?;
        *vlm_usage = analysis.usage;
        debug!("{} 识别文本预览: {}", item, truncate_text(&analysis.text, 50));

        let wscore = apply_sensitivity(analysis.raw_score, self.sensitivity_factor);
        push_log(
            logs,
            progress,
            item,
            format!("识别完成，书写分 {:.3} (原始 {:.3})", wscore, analysis.raw_score),
        );

        // ========== 阶段 2: LLM 批改 ==========
        info!("{} 📝 LLM 批改中", item);
        let report = retry_with_backoff(&self.retry, |attempt| {
            if attempt > 0 {
                progress.log(format!(
                    "{} LLM 第 {}/{} 次尝试",
                    item,
                    attempt + 1,
                    self.retry.max_attempts
                ));
            }
            self.llm.generate_report(&ctx.topic, wscore, &analysis.text)
        })
        .await?;
        *llm_usage = report.usage;

        // ========== 报告落盘 ==========
        tokio::fs::write(&item.report_path, &report.report)
            .await
            .map_err(|e| AppError::write_failed(item.report_path.display().to_string(), e))?;
        push_log(logs, progress, item, format!("已生成报告: {}", item.report_name()));

        // 用量写入失败视为该篇失败，保证界面计数与配置文件一致
        self.store
            .update_token_usage(&UsageTotals::from_stages(*vlm_usage, *llm_usage))?;

        Ok(())
    }
}

impl ItemProcessor for EssayFlow {
    fn process(
        &self,
        ctx: &RunCtx,
        item: &TaskItem,
        progress: &ProgressSender,
    ) -> impl Future<Output = ItemResult> + Send {
        async move {
            let mut logs = Vec::new();
            push_log(&mut logs, progress, item, format!("开始处理: {}", item.original_name));

            let mut vlm_usage = StageUsage::default();
            let mut llm_usage = StageUsage::default();

            match self
                .grade_essay(ctx, item, progress, &mut logs, &mut vlm_usage, &mut llm_usage)
                .await
            {
                Ok(()) => {
                    progress.usage(UsageTotals::from_stages(vlm_usage, llm_usage));
                    info!("{} ✅ 处理完成: {}", item, item.original_name);
                    ItemResult {
                        index: item.index,
                        original: item.original_name.clone(),
                        saved: Some(ctx.rel_path(&item.file_name())),
                        report: Some(ctx.rel_path(&item.report_name())),
                        vlm_usage,
                        llm_usage,
                        logs,
                        error: None,
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    push_log(&mut logs, progress, item, format!("处理失败: {}", message));
                    error!("{} ❌ 处理失败: {}", item, message);
                    ItemResult {
                        index: item.index,
                        original: item.original_name.clone(),
                        saved: Some(ctx.rel_path(&item.file_name())),
                        report: None,
                        vlm_usage,
                        llm_usage,
                        logs,
                        error: Some(message),
                    }
                }
            }
        }
    }
}

/// 一条任务日志同时写三处：进度通道（带任务前缀）、tracing、结果日志列表
fn push_log(logs: &mut Vec<String>, progress: &ProgressSender, item: &TaskItem, line: String) {
    progress.log(format!("{} {}", item, line));
    info!("{} {}", item, line);
    logs.push(line);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{progress_channel, ProgressEvent};

    #[test]
    fn test_push_log_fans_out() {
        let (tx, mut rx) = progress_channel();
        let item = TaskItem::new(0, "a.png".to_string(), "/tmp/a.png".into());
        let mut logs = Vec::new();

        push_log(&mut logs, &tx, &item, "开始处理: a.png".to_string());

        assert_eq!(logs, vec!["开始处理: a.png".to_string()]);
        let events = rx.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ProgressEvent::Log(s) if s == "[作文 1] 开始处理: a.png"));
    }

    #[tokio::test]
    async fn test_process_missing_image_fails_without_usage() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::load(dir.path().join("config.json")));
        let settings = RunSettings {
            retry_delay_secs: 0.0,
            ..RunSettings::default()
        };
        let flow = EssayFlow::new(&settings, store.clone());

        let (tx, mut rx) = progress_channel();
        let ctx = RunCtx::new(
            "run-1".to_string(),
            "题目".to_string(),
            dir.path().to_path_buf(),
        );
        // 图片不存在：永久错误，不应消耗重试等待，也不应计入用量
        let item = TaskItem::new(0, "ghost.png".to_string(), dir.path().join("ghost.png"));

        let result = flow.process(&ctx, &item, &tx).await;

        assert!(!result.is_success());
        assert!(result.report.is_none());
        assert!(result.logs.iter().any(|l| l.starts_with("处理失败")));
        assert!(store.usage_totals().is_zero());

        let events = rx.drain();
        assert!(events.iter().any(|e| matches!(e, ProgressEvent::Log(_))));
        assert!(!events.iter().any(|e| matches!(e, ProgressEvent::UsageUpdate(_))));
    }
}
