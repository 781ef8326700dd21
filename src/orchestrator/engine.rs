//! 批改引擎 - 编排层对外边界
//!
//! ## 职责
//!
//! 作为展示层（CLI / Web 壳）唯一的入口，聚合下层所有能力：
//!
//! ```text
//! 展示层
//!   ↓ submit_run / poll_events / run_status / 配置读写
//! Engine（本模块）
//!   ↓ 读配置快照，分配运行目录，落盘输入
//!   ↓ tokio::spawn(dispatch_batch(...))      ← 提交后立即返回
//! dispatcher → EssayFlow → services
//! ```
//!
//! ## 核心功能
//!
//! 1. **提交批次**：校验题目与配置 → 分配运行目录 → 复制输入 → 后台调度
//! 2. **事件轮询**：非阻塞地取走一个运行积压的全部进度事件
//! 3. **状态查询**：随时返回运行的完整快照（含逐篇结果与失败明细）
//! 4. **配置读写**：带校验的设置更新，敏感项只写不读
//!
//! ## 设计特点
//!
//! - **提交即返回**：submit_run 不等待任何模型调用，批次在后台执行
//! - **配置快照**：批次启动时读定配置，运行中改设置不影响已提交的批次
//! - **先校验后落盘**：一次更新里任意一项非法则整体拒绝，不留半套配置

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::config::RunSettings;
use crate::error::{AppError, AppResult};
use crate::infrastructure::{
    progress_channel, ConfigStore, ProgressEvent, ProgressReceiver, SENSITIVE_KEYS,
};
use crate::model::{RunSnapshot, RunState, RunStatus, UsageTotals};
use crate::orchestrator::dispatcher::dispatch_batch;
use crate::orchestrator::run_manager::{stage_inputs, RunManager, RunRegistry};
use crate::services::DEFAULT_LLM_PROMPT_TEMPLATE;
use crate::workflow::{EssayFlow, RunCtx};

/// 提交批次后的回执
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub run_id: String,
    pub status: RunStatus,
    pub total: usize,
    pub run_path: String,
}

/// 面向展示层的配置总览（敏感项脱敏，只暴露是否已设置）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigOverview {
    pub vlm_url: String,
    pub has_vlm_api_key: bool,
    pub vlm_model: String,
    pub vlm_temperature: f64,
    pub llm_url: String,
    pub has_llm_api_key: bool,
    pub llm_model: String,
    pub llm_temperature: f64,
    pub sensitivity_factor: f64,
    pub max_workers: u64,
    pub max_retries: u64,
    pub retry_delay: u64,
    pub retry_backoff: bool,
    pub request_timeout: f64,
    pub output_directory: String,
    /// 生效中的报告模板；未自定义时返回内置模板全文
    pub llm_prompt_template: String,
    pub usage: UsageTotals,
}

/// 经过校验的单项配置变更
enum ConfigOp {
    Set(String, Value),
    Remove(String),
    Skip,
}

/// 批改引擎
pub struct Engine {
    store: Arc<ConfigStore>,
    registry: Arc<RunRegistry>,
    /// 每个进行中的运行一条进度通道，消费端归引擎所有
    channels: Mutex<HashMap<String, ProgressReceiver>>,
}

impl Engine {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            registry: Arc::new(RunRegistry::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// 提交一个批改批次，立即返回回执，处理在后台进行
    ///
    /// 配置不完整、题目为空或任一输入文件缺失都会在此拒绝，
    /// 不产生任何后台任务。
    pub fn submit_run(&self, topic: &str, inputs: &[PathBuf]) -> AppResult<SubmitReceipt> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(AppError::invalid_value("topic", "请输入作文题目"));
        }

        let settings = RunSettings::from_store(&self.store)?;
        let manager = RunManager::new(&settings.output_directory)?;
        let (run_id, run_dir) = manager.allocate_run()?;
        let items = stage_inputs(&run_dir, inputs)?;
        let total = items.len();

        self.registry
            .insert(RunState::new(run_id.clone(), total, run_id.clone()));
        let (tx, rx) = progress_channel();
        self.channels.lock().insert(run_id.clone(), rx);

        let ctx = Arc::new(RunCtx::new(run_id.clone(), topic.to_string(), run_dir));
        let flow = Arc::new(EssayFlow::new(&settings, self.store.clone()));
        let registry = self.registry.clone();
        let max_workers = settings.max_workers;

        info!(
            "📤 [运行 {}] 已入列: 题目「{}」, 共 {} 篇",
            run_id, topic, total
        );

        tokio::spawn(async move {
            let run_id = ctx.run_id.clone();
            let dispatch = tokio::spawn(dispatch_batch(
                flow,
                ctx,
                items,
                max_workers,
                tx.clone(),
                registry.clone(),
            ));
            if let Err(e) = dispatch.await {
                // 调度任务本身异常时也要收尾，Finished 仍然恰好一条
                error!("[运行 {}] ❌ 批处理任务失败: {}", run_id, e);
                registry.fail_run(&run_id, format!("批处理任务失败: {}", e));
                tx.finished();
            }
        });

        Ok(SubmitReceipt {
            run_id: run_id.clone(),
            status: RunStatus::Queued,
            total,
            run_path: run_id,
        })
    }

    /// 取走一个运行积压的全部进度事件（非阻塞）
    ///
    /// 取到 `Finished` 后通道即被回收，之后对该运行返回空列表；
    /// 从未提交过的运行返回错误。
    pub fn poll_events(&self, run_id: &str) -> AppResult<Vec<ProgressEvent>> {
        let mut channels = self.channels.lock();
        match channels.get_mut(run_id) {
            Some(rx) => {
                let events = rx.drain();
                if events
                    .iter()
                    .any(|e| matches!(e, ProgressEvent::Finished))
                {
                    channels.remove(run_id);
                }
                Ok(events)
            }
            None => {
                if self.registry.contains(run_id) {
                    Ok(Vec::new())
                } else {
                    Err(AppError::run_not_found(run_id))
                }
            }
        }
    }

    /// 返回一个运行的完整状态快照
    pub fn run_status(&self, run_id: &str) -> AppResult<RunSnapshot> {
        self.registry
            .snapshot(run_id)
            .ok_or_else(|| AppError::run_not_found(run_id))
    }

    /// 检查必填配置是否齐全
    pub fn check_settings(&self) -> AppResult<()> {
        self.store.check_settings()
    }

    /// 读取单个配置项（敏感项一律返回空串）
    pub fn get_config(&self, key: &str) -> String {
        if SENSITIVE_KEYS.contains(&key) {
            return String::new();
        }
        self.store.get_str(key)
    }

    /// 校验并持久化单个配置项
    pub fn set_config(&self, key: &str, value: &str) -> AppResult<()> {
        self.apply_settings(&[(key.to_string(), value.to_string())])
    }

    /// 校验并持久化一组配置项
    ///
    /// 全部条目先通过校验才落盘；任意一项非法则整组拒绝。
    pub fn apply_settings(&self, entries: &[(String, String)]) -> AppResult<()> {
        let mut ops = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            ops.push(validate_entry(key, value)?);
        }
        self.store.update(|map| {
            for op in ops {
                match op {
                    ConfigOp::Set(key, value) => {
                        map.insert(key, value);
                    }
                    ConfigOp::Remove(key) => {
                        map.remove(&key);
                    }
                    ConfigOp::Skip => {}
                }
            }
        })
    }

    /// 返回脱敏后的配置总览
    pub fn config_overview(&self) -> ConfigOverview {
        let template = {
            let raw = self.store.get_str("LlmPromptTemplate");
            if raw.trim().is_empty() {
                DEFAULT_LLM_PROMPT_TEMPLATE.to_string()
            } else {
                raw
            }
        };
        ConfigOverview {
            vlm_url: self.store.get_str("VlmUrl"),
            has_vlm_api_key: self.store.has_key("VlmApiKey"),
            vlm_model: self.store.get_str("VlmModel"),
            vlm_temperature: self.store.get_f64("VlmTemperature", 0.0),
            llm_url: self.store.get_str("LlmUrl"),
            has_llm_api_key: self.store.has_key("LlmApiKey"),
            llm_model: self.store.get_str("LlmModel"),
            llm_temperature: self.store.get_f64("LlmTemperature", 0.0),
            sensitivity_factor: self.store.get_f64("SensitivityFactor", 1.0),
            max_workers: self.store.get_u64("MaxWorkers", 4),
            max_retries: self.store.get_u64("MaxRetries", 3),
            retry_delay: self.store.get_u64("RetryDelay", 5),
            retry_backoff: self.store.get_bool("RetryBackoff", false),
            request_timeout: self.store.get_f64("RequestTimeout", 120.0),
            output_directory: {
                let dir = self.store.get_str("OutputDirectory");
                if dir.trim().is_empty() {
                    RunSettings::default().output_directory
                } else {
                    dir
                }
            },
            llm_prompt_template: template,
            usage: self.store.usage_totals(),
        }
    }
}

/// 校验单项配置变更，转换为待执行操作
fn validate_entry(key: &str, value: &str) -> AppResult<ConfigOp> {
    const STRING_FIELDS: [&str; 5] = ["VlmUrl", "VlmModel", "LlmUrl", "LlmModel", "OutputDirectory"];
    const INT_FIELDS: [&str; 3] = ["MaxWorkers", "MaxRetries", "RetryDelay"];
    const FLOAT_FIELDS: [(&str, f64, Option<f64>); 3] = [
        ("RequestTimeout", 1.0, None),
        ("VlmTemperature", 0.0, Some(2.0)),
        ("LlmTemperature", 0.0, Some(2.0)),
    ];

    let trimmed = value.trim();

    if STRING_FIELDS.contains(&key) {
        if key == "OutputDirectory" && trimmed.is_empty() {
            return Err(AppError::invalid_value(key, "输出目录不能为空"));
        }
        return Ok(ConfigOp::Set(
            key.to_string(),
            Value::String(trimmed.to_string()),
        ));
    }

    if SENSITIVE_KEYS.contains(&key) {
        // 空值不覆盖已保存的密钥，清除走 Clear* 开关
        if trimmed.is_empty() {
            return Ok(ConfigOp::Skip);
        }
        return Ok(ConfigOp::Set(
            key.to_string(),
            Value::String(trimmed.to_string()),
        ));
    }

    if key == "ClearVlmApiKey" || key == "ClearLlmApiKey" {
        let target = if key == "ClearVlmApiKey" {
            "VlmApiKey"
        } else {
            "LlmApiKey"
        };
        return Ok(if is_truthy(trimmed) {
            ConfigOp::Remove(target.to_string())
        } else {
            ConfigOp::Skip
        });
    }

    if INT_FIELDS.contains(&key) {
        if trimmed.is_empty() {
            return Ok(ConfigOp::Skip);
        }
        let parsed: i64 = trimmed
            .parse()
            .map_err(|_| AppError::invalid_value(key, format!("{} 需要是整数", key)))?;
        return Ok(ConfigOp::Set(key.to_string(), Value::from(parsed)));
    }

    if let Some((_, min, max)) = FLOAT_FIELDS.iter().find(|(name, _, _)| *name == key) {
        if trimmed.is_empty() {
            return Ok(ConfigOp::Skip);
        }
        let parsed: f64 = trimmed
            .parse()
            .map_err(|_| AppError::invalid_value(key, format!("{} 需要是数字", key)))?;
        if parsed < *min {
            return Err(AppError::invalid_value(
                key,
                format!("{} 不能小于 {}", key, min),
            ));
        }
        if let Some(max) = max {
            if parsed > *max {
                return Err(AppError::invalid_value(
                    key,
                    format!("{} 不能大于 {}", key, max),
                ));
            }
        }
        return Ok(ConfigOp::Set(key.to_string(), Value::from(parsed)));
    }

    if key == "SensitivityFactor" {
        if trimmed.is_empty() {
            return Ok(ConfigOp::Skip);
        }
        let parsed: f64 = trimmed
            .parse()
            .map_err(|_| AppError::invalid_value(key, "SensitivityFactor 需要是数字"))?;
        return Ok(ConfigOp::Set(key.to_string(), Value::from(parsed)));
    }

    if key == "RetryBackoff" {
        return Ok(ConfigOp::Set(key.to_string(), Value::Bool(is_truthy(trimmed))));
    }

    if key == "LlmPromptTemplate" {
        // 清空或改回内置模板时直接移除，保持"未自定义"状态
        if trimmed.is_empty() || trimmed == DEFAULT_LLM_PROMPT_TEMPLATE.trim() {
            return Ok(ConfigOp::Remove(key.to_string()));
        }
        return Ok(ConfigOp::Set(
            key.to_string(),
            Value::String(trimmed.to_string()),
        ));
    }

    Err(AppError::invalid_value(key, format!("未知的配置项: {}", key)))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
