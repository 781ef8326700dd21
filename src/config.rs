use crate::error::AppResult;
use crate::infrastructure::ConfigStore;

/// 一次批改运行所需的全部配置快照
///
/// 在提交批次时从 [`ConfigStore`] 读取一次，之后各工作任务只读此快照，
/// 运行中途修改设置不影响已提交的批次。
#[derive(Clone, Debug)]
pub struct RunSettings {
    // --- VLM（第一阶段：识别手写原文并打分）---
    pub vlm_url: String,
    pub vlm_api_key: String,
    pub vlm_model: String,
    pub vlm_temperature: f32,
    // --- LLM（第二阶段：生成批改报告）---
    pub llm_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    /// 自定义批改提示词模板；None 表示使用内置模板
    pub prompt_template: Option<String>,
    /// 卷面分敏感度指数（对 0~1 的原始分做幂运算）
    pub sensitivity_factor: f64,
    /// 报告输出根目录
    pub output_directory: String,
    /// 同时处理的作文数量
    pub max_workers: usize,
    /// 单阶段最大尝试次数（含首次）
    pub max_retries: u32,
    /// 重试间隔（秒）
    pub retry_delay_secs: f64,
    /// 重试间隔是否逐次翻倍
    pub retry_backoff: bool,
    /// 单次模型调用超时（秒）
    pub request_timeout_secs: f64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            vlm_url: String::new(),
            vlm_api_key: String::new(),
            vlm_model: "gemini-2.5-pro".to_string(),
            vlm_temperature: 1.0,
            llm_url: String::new(),
            llm_api_key: String::new(),
            llm_model: "gemini-2.5-pro".to_string(),
            llm_temperature: 1.0,
            prompt_template: None,
            sensitivity_factor: 1.0,
            output_directory: "output_reports".to_string(),
            max_workers: 4,
            max_retries: 3,
            retry_delay_secs: 5.0,
            retry_backoff: false,
            request_timeout_secs: 120.0,
        }
    }
}

impl RunSettings {
    /// 从配置存储读取一份快照
    ///
    /// 先做必填项检查（缺失时带界面名称报错），再对数值项做兜底：
    /// 温度超出 [0, 2] 回落到 1.0，敏感度非正/非法回落到 1.0，
    /// 并发数与重试次数至少为 1，超时至少 1 秒。
    pub fn from_store(store: &ConfigStore) -> AppResult<Self> {
        store.check_settings()?;
        let default = Self::default();

        let prompt_template = {
            let raw = store.get_str("LlmPromptTemplate");
            if raw.trim().is_empty() {
                None
            } else {
                Some(raw)
            }
        };

        Ok(Self {
            vlm_url: store.get_str("VlmUrl"),
            vlm_api_key: store.get_str("VlmApiKey"),
            vlm_model: store.get_str("VlmModel"),
            vlm_temperature: clamp_temperature(
                store.get_f64("VlmTemperature", default.vlm_temperature as f64),
            ),
            llm_url: store.get_str("LlmUrl"),
            llm_api_key: store.get_str("LlmApiKey"),
            llm_model: store.get_str("LlmModel"),
            llm_temperature: clamp_temperature(
                store.get_f64("LlmTemperature", default.llm_temperature as f64),
            ),
            prompt_template,
            sensitivity_factor: {
                let factor = store.get_f64("SensitivityFactor", default.sensitivity_factor);
                if factor.is_finite() && factor > 0.0 {
                    factor
                } else {
                    1.0
                }
            },
            output_directory: {
                let dir = store.get_str("OutputDirectory");
                if dir.trim().is_empty() {
                    default.output_directory
                } else {
                    dir
                }
            },
            max_workers: store.get_u64("MaxWorkers", default.max_workers as u64).max(1) as usize,
            max_retries: store.get_u64("MaxRetries", default.max_retries as u64).max(1) as u32,
            retry_delay_secs: store
                .get_f64("RetryDelay", default.retry_delay_secs)
                .max(0.0),
            retry_backoff: store.get_bool("RetryBackoff", default.retry_backoff),
            request_timeout_secs: store
                .get_f64("RequestTimeout", default.request_timeout_secs)
                .max(1.0),
        })
    }
}

/// 温度超出 OpenAI 协议允许的 [0, 2] 区间时回落到 1.0
fn clamp_temperature(value: f64) -> f32 {
    if (0.0..=2.0).contains(&value) {
        value as f32
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn ready_store(dir: &tempfile::TempDir) -> ConfigStore {
        let store = ConfigStore::load(dir.path().join("config.json"));
        store.set("VlmUrl", Value::from("https://vlm.example/v1"));
        store.set("VlmApiKey", Value::from("sk-vlm"));
        store.set("VlmModel", Value::from("gemini-2.5-pro"));
        store.set("LlmUrl", Value::from("https://llm.example/v1"));
        store.set("LlmApiKey", Value::from("sk-llm"));
        store.set("LlmModel", Value::from("gemini-2.5-pro"));
        store.set("MaxRetries", Value::from(3));
        store.set("RetryDelay", Value::from(5));
        store
    }

    #[test]
    fn test_from_store_requires_complete_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("config.json"));
        assert!(RunSettings::from_store(&store).is_err());
    }

    #[test]
    fn test_from_store_reads_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = ready_store(&dir);
        store.set("MaxWorkers", Value::from(2));
        store.set("SensitivityFactor", Value::from(1.5));

        let settings = RunSettings::from_store(&store).unwrap();
        assert_eq!(settings.vlm_api_key, "sk-vlm");
        assert_eq!(settings.max_workers, 2);
        assert_eq!(settings.max_retries, 3);
        assert!((settings.sensitivity_factor - 1.5).abs() < 1e-9);
        assert_eq!(settings.output_directory, "output_reports");
        assert!(settings.prompt_template.is_none());
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ready_store(&dir);
        store.set("VlmTemperature", Value::from(9.9));
        store.set("SensitivityFactor", Value::from(-2));
        store.set("MaxWorkers", Value::from(0));
        store.set("RequestTimeout", Value::from(0));

        let settings = RunSettings::from_store(&store).unwrap();
        assert!((settings.vlm_temperature - 1.0).abs() < 1e-6);
        assert!((settings.sensitivity_factor - 1.0).abs() < 1e-9);
        assert_eq!(settings.max_workers, 1);
        assert!((settings.request_timeout_secs - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_blank_prompt_template_means_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let store = ready_store(&dir);
        store.set("LlmPromptTemplate", Value::from("   "));
        let settings = RunSettings::from_store(&store).unwrap();
        assert!(settings.prompt_template.is_none());

        store.set("LlmPromptTemplate", Value::from("老师口吻：{essay_text}"));
        let settings = RunSettings::from_store(&store).unwrap();
        assert_eq!(settings.prompt_template.as_deref(), Some("老师口吻：{essay_text}"));
    }
}
