//! 运行管理器 - 编排层
//!
//! ## 职责
//!
//! 1. **目录分配**：为每次提交分配唯一的时间戳 run id 和输出目录
//! 2. **输入暂存**：把用户的图片复制进运行目录（文件名清洗 + 去重）
//! 3. **状态登记**：维护所有运行的实时状态，供展示层轮询
//!
//! ## 设计特点
//!
//! - run id 形如 `20260825-101500`，同一秒内重复提交追加 `-2`、`-3` 后缀，
//!   唯一性由 `create_dir` 的"不存在才创建"语义保证
//! - 状态表由单把互斥锁保护，工作任务实时写入，展示层读快照

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{AppError, AppResult, PersistenceError, RunError};
use crate::model::{ItemResult, RunSnapshot, RunState, RunStatus};
use crate::workflow::essay_task::{safe_file_name, unique_file_name, TaskItem};

/// 运行目录分配器
pub struct RunManager {
    output_root: PathBuf,
}

impl RunManager {
    /// 解析输出根目录并确保其存在；相对路径基于当前工作目录
    pub fn new(configured: &str) -> AppResult<Self> {
        let base = PathBuf::from(configured);
        let output_root = if base.is_absolute() {
            base
        } else {
            std::env::current_dir()
                .map_err(|e| dir_error(configured, e))?
                .join(base)
        };
        fs::create_dir_all(&output_root).map_err(|e| dir_error(&output_root.display().to_string(), e))?;
        Ok(Self { output_root })
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// 分配唯一 run id 和对应输出目录
    pub fn allocate_run(&self) -> AppResult<(String, PathBuf)> {
        let base_id = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
        self.allocate_with_base(&base_id)
    }

    fn allocate_with_base(&self, base_id: &str) -> AppResult<(String, PathBuf)> {
        let mut run_id = base_id.to_string();
        let mut counter = 2;
        loop {
            let run_dir = self.output_root.join(&run_id);
            // create_dir 在目录已存在时失败，由此保证 run id 唯一
            match fs::create_dir(&run_dir) {
                Ok(()) => {
                    debug!("已分配运行目录: {}", run_dir.display());
                    return Ok((run_id, run_dir));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    run_id = format!("{}-{}", base_id, counter);
                    counter += 1;
                }
                Err(e) => return Err(dir_error(&run_dir.display().to_string(), e)),
            }
        }
    }
}

fn dir_error(path: &str, source: std::io::Error) -> AppError {
    AppError::Persistence(PersistenceError::DirCreateFailed {
        path: path.to_string(),
        source: Box::new(source),
    })
}

/// 把输入图片复制进运行目录，返回构建好的任务列表
///
/// 文件名先清洗再去重；任一文件缺失或复制失败都会让整次提交失败，
/// 不会留下"半暂存"的批次。
pub fn stage_inputs(run_dir: &Path, inputs: &[PathBuf]) -> AppResult<Vec<TaskItem>> {
    for input in inputs {
        if !input.is_file() {
            return Err(AppError::Run(RunError::InputNotFound {
                path: input.display().to_string(),
            }));
        }
    }

    let mut used = HashSet::new();
    let mut items = Vec::with_capacity(inputs.len());
    for (index, input) in inputs.iter().enumerate() {
        let original_name = input
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("upload_{}.png", index + 1));

        let safe = safe_file_name(&original_name, index);
        let name = unique_file_name(&used, &safe);
        used.insert(name.clone());

        let staged = run_dir.join(&name);
        fs::copy(input, &staged).map_err(|e| {
            AppError::Persistence(PersistenceError::CopyFailed {
                from: input.display().to_string(),
                to: staged.display().to_string(),
                source: Box::new(e),
            })
        })?;

        items.push(TaskItem::new(index, original_name, staged));
    }
    Ok(items)
}

/// 运行状态登记表
///
/// 工作任务在条目到达终态时实时写入，展示层随时读取快照。
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, RunState>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, state: RunState) {
        self.runs.lock().insert(state.run_id.clone(), state);
    }

    pub fn mark_running(&self, run_id: &str) {
        if let Some(state) = self.runs.lock().get_mut(run_id) {
            state.status = RunStatus::Running;
        }
    }

    /// 记录一个终态条目；未知 run id 静默忽略
    pub fn record_item(&self, run_id: &str, result: ItemResult) {
        if let Some(state) = self.runs.lock().get_mut(run_id) {
            state.record_item(result);
        }
    }

    pub fn finalize(&self, run_id: &str, status: RunStatus) {
        if let Some(state) = self.runs.lock().get_mut(run_id) {
            state.finish(status);
        }
    }

    /// 批次级失败（调度器异常），与单条失败不同
    pub fn fail_run(&self, run_id: &str, message: String) {
        if let Some(state) = self.runs.lock().get_mut(run_id) {
            state.fail(message);
        }
    }

    pub fn snapshot(&self, run_id: &str) -> Option<RunSnapshot> {
        self.runs.lock().get(run_id).map(RunState::snapshot)
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.runs.lock().contains_key(run_id)
    }
}
