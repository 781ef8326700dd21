//! 配置存储 - 基础设施层
//!
//! ## 职责
//!
//! 管理应用配置文件（`config.json`）：加载、保存、敏感项的自动加解密、
//! token 用量累计。整个存储由单把互斥锁保护，`set`+`save` 组合
//! 在同一临界区内完成，避免并发写入产生撕裂文件或丢失累计值。
//!
//! ## 约定
//!
//! - 文件缺失：创建空配置，绝不报错
//! - 文件损坏：降级为空的内存配置并打警告日志
//! - 敏感项在内存中保存明文（加载时解密），`save()` 时加密落盘；
//!   磁盘上永远不出现敏感项明文
//! - 解密失败的敏感项降级为空字符串，而不是错误
//! - 落盘先写 `<path>.tmp` 再重命名，中途崩溃不会留下截断文件

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult, ConfigError};
use crate::infrastructure::crypto::ConfigCipher;
use crate::model::UsageTotals;

/// 需要加密存储的配置项
pub const SENSITIVE_KEYS: [&str; 2] = ["VlmApiKey", "LlmApiKey"];

/// 提交批次前必须存在的配置项及其界面名称
const REQUIRED_SETTINGS: [(&str, &str); 8] = [
    ("VlmUrl", "VLM服务地址"),
    ("VlmApiKey", "VLM服务密钥"),
    ("VlmModel", "VLM模型名称"),
    ("LlmUrl", "LLM服务地址"),
    ("LlmApiKey", "LLM服务密钥"),
    ("LlmModel", "LLM模型名称"),
    ("MaxRetries", "最大重试次数"),
    ("RetryDelay", "重试延迟时间(秒)"),
];

/// 配置存储
pub struct ConfigStore {
    path: PathBuf,
    cipher: ConfigCipher,
    entries: Mutex<Map<String, Value>>,
}

impl ConfigStore {
    /// 从文件加载配置
    ///
    /// 文件不存在时创建空配置并落盘；文件无法读取或解析时
    /// 降级为空的内存配置。此函数永不失败。
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cipher = ConfigCipher::new();
        let mut entries = Map::new();
        let mut file_missing = false;

        match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Map<String, Value>>(&text) {
                Ok(raw) => entries = decrypt_sensitive(&cipher, raw),
                Err(e) => warn!("⚠️ 配置文件解析失败，使用空配置 ({}): {}", path.display(), e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("配置文件不存在，创建空配置: {}", path.display());
                file_missing = true;
            }
            Err(e) => warn!("⚠️ 读取配置文件失败，使用空配置 ({}): {}", path.display(), e),
        }

        let store = Self {
            path,
            cipher,
            entries: Mutex::new(entries),
        };

        if file_missing {
            if let Err(e) = store.save() {
                warn!("⚠️ 初始化配置文件失败: {}", e);
            }
        }

        store
    }

    /// 配置文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 获取原始配置值
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    /// 获取字符串值；缺失或类型不符时返回空串
    pub fn get_str(&self, key: &str) -> String {
        match self.entries.lock().get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        }
    }

    /// 获取浮点值；缺失或无法解析时返回默认值
    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.entries.lock().get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// 获取无符号整数值；缺失或无法解析时返回默认值
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.entries.lock().get(key) {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
                .unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// 获取布尔值；字符串按 "1"/"true"/"yes"/"on" 解释
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.entries.lock().get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => {
                matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
            }
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
            _ => default,
        }
    }

    /// 该配置项是否存在非空值
    pub fn has_key(&self, key: &str) -> bool {
        !self.get_str(key).trim().is_empty()
    }

    /// 仅更新内存中的值（不落盘）
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.entries.lock().insert(key.into(), value);
    }

    /// 保存当前配置到文件（敏感项在此时加密）
    pub fn save(&self) -> AppResult<()> {
        let entries = self.entries.lock();
        self.write_locked(&entries)
    }

    /// 在同一临界区内修改并保存
    ///
    /// 所有"读-改-写"组合（用量累计、设置界面批量更新）都必须走此入口，
    /// 保证不同写入方不会互相覆盖。
    pub fn update(&self, f: impl FnOnce(&mut Map<String, Value>)) -> AppResult<()> {
        let mut entries = self.entries.lock();
        f(&mut entries);
        self.write_locked(&entries)
    }

    /// 设置单个值并保存
    pub fn set_and_save(&self, key: impl Into<String>, value: Value) -> AppResult<()> {
        let key = key.into();
        self.update(|entries| {
            entries.insert(key, value);
        })
    }

    /// 删除单个键并保存
    pub fn remove_and_save(&self, key: &str) -> AppResult<()> {
        self.update(|entries| {
            entries.remove(key);
        })
    }

    /// 累加一次成功调用的 token 用量并保存
    pub fn update_token_usage(&self, delta: &UsageTotals) -> AppResult<()> {
        self.update(|entries| {
            for (key, add) in [
                ("UsageVlmInput", delta.vlm_input),
                ("UsageVlmOutput", delta.vlm_output),
                ("UsageLlmInput", delta.llm_input),
                ("UsageLlmOutput", delta.llm_output),
            ] {
                let current = entries.get(key).and_then(Value::as_u64).unwrap_or(0);
                entries.insert(key.to_string(), Value::from(current + add));
            }
        })
    }

    /// 读取累计 token 用量
    pub fn usage_totals(&self) -> UsageTotals {
        UsageTotals {
            vlm_input: self.get_u64("UsageVlmInput", 0),
            vlm_output: self.get_u64("UsageVlmOutput", 0),
            llm_input: self.get_u64("UsageLlmInput", 0),
            llm_output: self.get_u64("UsageLlmOutput", 0),
        }
    }

    /// 检查所有必需配置项是否已设置
    ///
    /// 返回第一个缺失项的错误（含界面名称），供提交前拦截。
    pub fn check_settings(&self) -> AppResult<()> {
        for (key, label) in REQUIRED_SETTINGS {
            if self.get_str(key).trim().is_empty() {
                return Err(AppError::config_missing(key, label));
            }
        }
        Ok(())
    }

    /// 序列化并原子落盘；调用方必须已持有配置锁
    fn write_locked(&self, entries: &Map<String, Value>) -> AppResult<()> {
        let mut on_disk = entries.clone();
        for key in SENSITIVE_KEYS {
            if let Some(value) = on_disk.get_mut(key) {
                let plain = match value.as_str() {
                    Some(s) => s.to_string(),
                    None => value.to_string(),
                };
                let token = self.cipher.encrypt(&plain).ok_or_else(|| {
                    AppError::Config(ConfigError::EncryptFailed {
                        key: key.to_string(),
                    })
                })?;
                *value = Value::String(token);
            }
        }

        let text = serde_json::to_string_pretty(&Value::Object(on_disk))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text).map_err(|e| AppError::write_failed(tmp.display().to_string(), e))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| AppError::write_failed(self.path.display().to_string(), e))?;
        Ok(())
    }
}

/// 加载时解密敏感项；解密失败降级为空字符串
fn decrypt_sensitive(cipher: &ConfigCipher, mut raw: Map<String, Value>) -> Map<String, Value> {
    for key in SENSITIVE_KEYS {
        if let Some(value) = raw.get_mut(key) {
            let token = value.as_str().unwrap_or_default();
            let plain = match cipher.decrypt(token) {
                Some(plain) => plain,
                None => {
                    warn!("⚠️ 配置项 {} 解密失败，降级为空值", key);
                    String::new()
                }
            };
            *value = Value::String(plain);
        }
    }
    raw
}
