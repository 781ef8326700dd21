//! 任务上下文
//!
//! 封装"我正在批改哪次运行的第几篇作文"这一信息

use std::collections::HashSet;
use std::fmt::Display;
use std::path::{Path, PathBuf};

/// 一次批改运行的共享上下文
#[derive(Debug, Clone)]
pub struct RunCtx {
    /// 运行 ID（时间戳，目录名）
    pub run_id: String,
    /// 作文题目 / 场景说明
    pub topic: String,
    /// 本次运行的输出目录（含暂存图片与报告）
    pub run_dir: PathBuf,
}

impl RunCtx {
    pub fn new(run_id: String, topic: String, run_dir: PathBuf) -> Self {
        Self {
            run_id,
            topic,
            run_dir,
        }
    }

    /// 输出根目录下的相对路径（用于展示层链接）
    pub fn rel_path(&self, file_name: &str) -> String {
        format!("{}/{}", self.run_id, file_name)
    }
}

/// 单篇作文任务
///
/// 图片已暂存到运行目录，报告路径在构造时确定（`<stem>_report.md`）。
#[derive(Debug, Clone)]
pub struct TaskItem {
    /// 在本次批次中的序号（从 0 开始）
    pub index: usize,
    /// 用户上传时的原始文件名（仅用于展示）
    pub original_name: String,
    /// 暂存后的图片路径
    pub image_path: PathBuf,
    /// 批改报告写入路径
    pub report_path: PathBuf,
}

impl TaskItem {
    pub fn new(index: usize, original_name: String, image_path: PathBuf) -> Self {
        let stem = image_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("essay_{}", index + 1));
        let report_path = image_path.with_file_name(format!("{}_report.md", stem));
        Self {
            index,
            original_name,
            image_path,
            report_path,
        }
    }

    /// 暂存文件名
    pub fn file_name(&self) -> String {
        self.image_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// 报告文件名
    pub fn report_name(&self) -> String {
        self.report_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl Display for TaskItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[作文 {}]", self.index + 1)
    }
}

/// 清洗上传文件名：只保留最后一段路径，危险字符替换为下划线
///
/// 清洗后没有可用主名时回退到 `upload_{N}.png`。
pub fn safe_file_name(original: &str, index: usize) -> String {
    let base = Path::new(original)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();

    let has_stem = Path::new(&cleaned)
        .file_stem()
        .map(|s| s.to_string_lossy().chars().any(|c| c != '_' && c != '.'))
        .unwrap_or(false);
    if has_stem {
        cleaned
    } else {
        format!("upload_{}.png", index + 1)
    }
}

/// 暂存文件名去重：重名时依次尝试 `{stem}_1{ext}`、`{stem}_2{ext}` ...
pub fn unique_file_name(used: &HashSet<String>, name: &str) -> String {
    if !used.contains(name) {
        return name.to_string();
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let ext = path
        .extension()
        .map(|s| format!(".{}", s.to_string_lossy()))
        .unwrap_or_else(|| ".png".to_string());

    let mut counter = 1;
    loop {
        let candidate = format!("{}_{}{}", stem, counter, ext);
        if !used.contains(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}
