//! # Essay Corrector
//!
//! 一个批量批改手写作文图片的 Rust 引擎
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 加密配置存储与进度通道
//! - `ConfigStore` - 唯一的配置 owner，敏感项只以密文落盘
//! - `progress_channel` - 多生产者单消费者的进度事件通道
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单篇作文
//! - `VlmService` - 看图识字 + 书写打分能力
//! - `LlmService` - 批改报告生成能力
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一篇作文"的完整处理流程
//! - `RunCtx` / `TaskItem` - 运行上下文与任务封装
//! - `EssayFlow` - 流程编排（识别 → 变换 → 批改 → 落盘，带重试）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/engine` - 对外边界：提交、轮询、状态、配置
//! - `orchestrator/dispatcher` - 批量调度器，管并发和批次终态
//! - `orchestrator/run_manager` - 运行目录分配与状态表
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod infrastructure;
pub mod model;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::RunSettings;
pub use error::{AppError, AppResult};
pub use infrastructure::{ConfigStore, ProgressEvent};
pub use model::{ItemResult, RunSnapshot, RunStatus, UsageTotals};
pub use orchestrator::{ConfigOverview, Engine, SubmitReceipt};
pub use workflow::{EssayFlow, ItemProcessor, RunCtx, TaskItem};
