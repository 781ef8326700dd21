//! 批量调度器 - 编排层
//!
//! ## 职责
//!
//! 接收一个批次的全部作文任务，在并发上限内并行执行，
//! 并保证批次生命周期的两条硬性约束：
//!
//! 1. 每个条目恰好到达一个终态（成功或失败，panic 也会被合成为失败条目）
//! 2. 全部条目终结后恰好发布一条 `Finished` 事件
//!
//! ## 核心功能
//!
//! 1. **并发控制**：使用 Semaphore 限制同时执行的任务数量
//! 2. **实时登记**：每个任务完成即写入状态表，展示层无需等待批次结束
//! 3. **进度推送**：每个终态推送一格进度，批次结束推送 `Finished`
//! 4. **终态推导**：根据成败分布推导 ok / partial / failed / empty
//!
//! ## 设计特点
//!
//! - **失败隔离**：单篇失败绝不影响其他篇目，也不会中断批次
//! - **向下委托**：单篇细节全部交给 [`ItemProcessor`]，本层只做调度和统计

use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::infrastructure::ProgressSender;
use crate::model::{ItemResult, RunStatus, StageUsage};
use crate::orchestrator::run_manager::RunRegistry;
use crate::workflow::{ItemProcessor, RunCtx, TaskItem};

/// 一次批次的汇总统计
#[derive(Debug, Default, Clone, Copy)]
pub struct RunStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

impl RunStats {
    /// 由成败分布推导批次终态
    pub fn status(&self) -> RunStatus {
        if self.total == 0 {
            RunStatus::Empty
        } else if self.failed == 0 {
            RunStatus::Ok
        } else if self.failed == self.total {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }
}

/// 并行处理一个批次的全部任务
///
/// 永不失败：单篇的错误都体现在状态表和统计里。
pub async fn dispatch_batch<P>(
    processor: Arc<P>,
    ctx: Arc<RunCtx>,
    items: Vec<TaskItem>,
    max_workers: usize,
    progress: ProgressSender,
    registry: Arc<RunRegistry>,
) -> RunStats
where
    P: ItemProcessor + 'static,
{
    let total = items.len();
    registry.mark_running(&ctx.run_id);
    log_run_start(&ctx.run_id, total, max_workers);

    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut handles = Vec::with_capacity(total);

    for item in items {
        let index = item.index;
        let original = item.original_name.clone();
        let processor = processor.clone();
        let ctx = ctx.clone();
        let progress = progress.clone();
        let registry = registry.clone();
        let semaphore = semaphore.clone();

        let handle = tokio::spawn(async move {
            // 信号量从不关闭，acquire 只在关闭后才会失败
            let _permit = semaphore.acquire_owned().await.ok();

            let result = processor.process(&ctx, &item, &progress).await;
            let success = result.is_success();

            // 终态实时写入状态表，随后推进度；顺序保证
            // 展示层看到的完成数不会超前于结果
            registry.record_item(&ctx.run_id, result);
            progress.advance();
            success
        });
        handles.push((index, original, handle));
    }

    let mut stats = RunStats {
        total,
        ..Default::default()
    };

    for (index, original, handle) in handles {
        match handle.await {
            Ok(true) => {
                stats.success += 1;
            }
            Ok(false) => {
                stats.failed += 1;
            }
            Err(e) => {
                // 任务 panic：合成失败条目，维持"每篇恰好一个终态"
                error!("[作文 {}] ❌ 任务执行失败: {}", index + 1, e);
                let message = format!("任务异常终止: {}", e);
                registry.record_item(
                    &ctx.run_id,
                    ItemResult {
                        index,
                        original,
                        saved: None,
                        report: None,
                        vlm_usage: StageUsage::default(),
                        llm_usage: StageUsage::default(),
                        logs: vec![format!("处理失败: {}", message)],
                        error: Some(message),
                    },
                );
                progress.advance();
                stats.failed += 1;
            }
        }
    }

    let status = stats.status();
    registry.finalize(&ctx.run_id, status);
    progress.finished();
    log_run_complete(&ctx.run_id, status, &stats);

    stats
}

// ========== 日志辅助函数 ==========

fn log_run_start(run_id: &str, total: usize, max_workers: usize) {
    info!("{}", "=".repeat(60));
    info!("🚀 [运行 {}] 开始批改，共 {} 篇作文", run_id, total);
    info!("📊 最大并发数: {}", max_workers);
    info!("{}", "=".repeat(60));
}

fn log_run_complete(run_id: &str, status: RunStatus, stats: &RunStats) {
    info!("\n{}", "─".repeat(60));
    info!("✓ [运行 {}] 批改结束，状态: {}", run_id, status);
    info!("✅ 成功: {}/{}", stats.success, stats.total);
    info!("❌ 失败: {}", stats.failed);
    info!("{}", "─".repeat(60));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{progress_channel, ProgressEvent};
    use crate::model::{RunState, UsageTotals};
    use std::collections::HashSet;
    use std::future::Future;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 不访问网络的假处理器：按序号决定成败，并记录并发高水位
    struct MockProcessor {
        fail_indices: HashSet<usize>,
        active: AtomicUsize,
        high_water: AtomicUsize,
        delay: Duration,
    }

    impl MockProcessor {
        fn new(fail_indices: impl IntoIterator<Item = usize>, delay: Duration) -> Self {
            Self {
                fail_indices: fail_indices.into_iter().collect(),
                active: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                delay,
            }
        }
    }

    impl ItemProcessor for MockProcessor {
        fn process(
            &self,
            ctx: &RunCtx,
            item: &TaskItem,
            progress: &ProgressSender,
        ) -> impl Future<Output = ItemResult> + Send {
            async move {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.high_water.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.active.fetch_sub(1, Ordering::SeqCst);

                progress.log(format!("{} 模拟处理: {}", item, item.original_name));
                if self.fail_indices.contains(&item.index) {
                    ItemResult {
                        index: item.index,
                        original: item.original_name.clone(),
                        saved: None,
                        report: None,
                        vlm_usage: StageUsage::default(),
                        llm_usage: StageUsage::default(),
                        logs: vec!["处理失败: 模拟失败".to_string()],
                        error: Some("模拟失败".to_string()),
                    }
                } else {
                    progress.usage(UsageTotals {
                        vlm_input: 10,
                        vlm_output: 5,
                        llm_input: 20,
                        llm_output: 15,
                    });
                    ItemResult {
                        index: item.index,
                        original: item.original_name.clone(),
                        saved: Some(ctx.rel_path(&item.file_name())),
                        report: Some(ctx.rel_path(&item.report_name())),
                        vlm_usage: StageUsage {
                            prompt_tokens: 10,
                            completion_tokens: 5,
                        },
                        llm_usage: StageUsage {
                            prompt_tokens: 20,
                            completion_tokens: 15,
                        },
                        logs: vec!["模拟完成".to_string()],
                        error: None,
                    }
                }
            }
        }
    }

    fn make_items(n: usize) -> Vec<TaskItem> {
        (0..n)
            .map(|i| {
                TaskItem::new(
                    i,
                    format!("essay_{}.png", i + 1),
                    PathBuf::from(format!("/tmp/r1/essay_{}.png", i + 1)),
                )
            })
            .collect()
    }

    fn make_ctx() -> Arc<RunCtx> {
        Arc::new(RunCtx::new(
            "r1".to_string(),
            "题目".to_string(),
            PathBuf::from("/tmp/r1"),
        ))
    }

    fn registry_for(total: usize) -> Arc<RunRegistry> {
        let registry = Arc::new(RunRegistry::new());
        registry.insert(RunState::new("r1".to_string(), total, "r1".to_string()));
        registry
    }

    #[test]
    fn test_status_mapping() {
        let s = |total, failed| RunStats {
            total,
            success: total - failed,
            failed,
        };
        assert_eq!(s(0, 0).status(), RunStatus::Empty);
        assert_eq!(s(5, 0).status(), RunStatus::Ok);
        assert_eq!(s(5, 2).status(), RunStatus::Partial);
        assert_eq!(s(5, 5).status(), RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_batch_emits_one_finished_and_all_terminals() {
        let registry = registry_for(5);
        let (tx, mut rx) = progress_channel();
        let processor = Arc::new(MockProcessor::new([1, 3], Duration::from_millis(5)));

        let stats =
            dispatch_batch(processor, make_ctx(), make_items(5), 2, tx, registry.clone()).await;

        assert_eq!(stats.success, 3);
        assert_eq!(stats.failed, 2);

        let events = rx.drain();
        let finished = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Finished))
            .count();
        let progress_total: u32 = events
            .iter()
            .map(|e| match e {
                ProgressEvent::Progress(n) => *n,
                _ => 0,
            })
            .sum();
        assert_eq!(finished, 1);
        assert_eq!(progress_total, 5);

        let snapshot = registry.snapshot("r1").unwrap();
        assert_eq!(snapshot.status, RunStatus::Partial);
        assert_eq!(snapshot.completed, 5);
        assert_eq!(snapshot.results.len(), 5);
        assert_eq!(snapshot.errors.len(), 2);
        // 聚合只来自成功条目
        assert_eq!(snapshot.aggregate.vlm_input, 30);
        assert_eq!(snapshot.aggregate.vlm_output, 15);
        assert_eq!(snapshot.aggregate.llm_input, 60);
        assert_eq!(snapshot.aggregate.llm_output, 45);
    }

    #[tokio::test]
    async fn test_worker_concurrency_never_exceeds_limit() {
        let registry = registry_for(8);
        let (tx, _rx) = progress_channel();
        let processor = Arc::new(MockProcessor::new([], Duration::from_millis(20)));

        let stats = dispatch_batch(
            processor.clone(),
            make_ctx(),
            make_items(8),
            3,
            tx,
            registry,
        )
        .await;

        assert_eq!(stats.success, 8);
        assert!(processor.high_water.load(Ordering::SeqCst) <= 3);
        // 并发上限大于 1 时应真正并行过
        assert!(processor.high_water.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_empty_batch_still_finishes() {
        let registry = registry_for(0);
        let (tx, mut rx) = progress_channel();
        let processor = Arc::new(MockProcessor::new([], Duration::from_millis(1)));

        let stats = dispatch_batch(processor, make_ctx(), vec![], 4, tx, registry.clone()).await;

        assert_eq!(stats.status(), RunStatus::Empty);
        let events = rx.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProgressEvent::Finished));

        let snapshot = registry.snapshot("r1").unwrap();
        assert_eq!(snapshot.status, RunStatus::Empty);
        assert_eq!(snapshot.completed, 0);
    }

    #[tokio::test]
    async fn test_all_failures_mark_run_failed() {
        let registry = registry_for(2);
        let (tx, _rx) = progress_channel();
        let processor = Arc::new(MockProcessor::new([0, 1], Duration::from_millis(1)));

        let stats = dispatch_batch(processor, make_ctx(), make_items(2), 1, tx, registry.clone()).await;

        assert_eq!(stats.failed, 2);
        let snapshot = registry.snapshot("r1").unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert!(snapshot.aggregate.is_zero());
        assert_eq!(snapshot.errors.len(), 2);
    }
}
