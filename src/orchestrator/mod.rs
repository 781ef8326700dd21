//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批次的全生命周期管理，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `engine` - 批改引擎（对外边界）
//! - 展示层唯一入口：提交批次、轮询事件、查询状态
//! - 配置读写（校验、脱敏、原子落盘）
//! - 提交时读定配置快照并启动后台调度任务
//!
//! ### `dispatcher` - 批量调度器
//! - 控制并发数量（Semaphore）
//! - 保证每篇恰好一个终态、批次恰好一条 Finished
//! - 推导批次终态（ok / partial / failed / empty）
//!
//! ### `run_manager` - 运行目录与状态表
//! - 分配唯一运行号和输出目录
//! - 复制输入文件（文件名消毒与去重）
//! - 维护所有运行的内存状态表（RunRegistry）
//!
//! ## 层次关系
//!
//! ```text
//! engine (对外边界，持有 RunRegistry 和进度通道)
//!     ↓
//! dispatcher (处理 Vec<TaskItem>)
//!     ↓
//! workflow::EssayFlow (处理单篇作文)
//!     ↓
//! services (能力层：vlm / llm)
//!     ↓
//! infrastructure (基础设施：配置存储 / 进度通道)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单一职责**：engine 管边界，dispatcher 管并发，run_manager 管目录和状态
//! 2. **资源隔离**：只有编排层持有 RunRegistry 和进度消费端
//! 3. **向下依赖**：编排层 → workflow → services → infrastructure
//! 4. **无业务逻辑**：只做调度和统计，批改细节在 workflow 层

pub mod dispatcher;
pub mod engine;
pub mod run_manager;

// 重新导出主要类型
pub use dispatcher::{dispatch_batch, RunStats};
pub use engine::{ConfigOverview, Engine, SubmitReceipt};
pub use run_manager::{stage_inputs, RunManager, RunRegistry};
