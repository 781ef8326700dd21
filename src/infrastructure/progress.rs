//! 进度通道 - 基础设施层
//!
//! ## 职责
//!
//! 将 N 个并发工作任务产生的状态事件汇聚给单一消费者（展示层）。
//! 发布端永不阻塞（无界队列），消费端通过 `drain()` 非阻塞取走
//! 当前积压的全部事件，由展示层按固定间隔（约 100ms）轮询。
//!
//! ## 顺序保证
//!
//! 同一发送端克隆发出的事件保持发送顺序；不同任务之间不保证全局顺序。
//! 消费者是唯一允许读取事件的一方，生产者绝不直接触碰展示层状态。

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::model::UsageTotals;

/// 批处理过程中上报的状态事件
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ProgressEvent {
    /// 一条面向用户的日志
    Log(String),
    /// 完成计数增量（成功或失败均计 1）
    Progress(u32),
    /// 一次成功调用产生的 token 用量
    UsageUpdate(UsageTotals),
    /// 整个批次结束（每次运行恰好一条）
    Finished,
}

/// 事件发送端；可任意克隆给各个工作任务
#[derive(Clone)]
pub struct ProgressSender {
    tx: UnboundedSender<ProgressEvent>,
}

impl ProgressSender {
    /// 发布一个事件；消费端已关闭时静默丢弃
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    pub fn log(&self, line: impl Into<String>) {
        self.publish(ProgressEvent::Log(line.into()));
    }

    /// 任务到达终态（成功或失败）时上报一格进度
    pub fn advance(&self) {
        self.publish(ProgressEvent::Progress(1));
    }

    pub fn usage(&self, totals: UsageTotals) {
        self.publish(ProgressEvent::UsageUpdate(totals));
    }

    pub fn finished(&self) {
        self.publish(ProgressEvent::Finished);
    }
}

/// 事件接收端；整个运行周期内只有一个
pub struct ProgressReceiver {
    rx: UnboundedReceiver<ProgressEvent>,
}

impl ProgressReceiver {
    /// 非阻塞取走当前积压的全部事件
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// 创建一对进度通道端点
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, ProgressReceiver { rx })
}
