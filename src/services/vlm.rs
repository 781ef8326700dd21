//! VLM 服务 - 业务能力层
//!
//! 只负责"看图识字 + 书写质量打分"能力，不关心流程
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 支持自定义 API 端点和模型
//! - 兼容 OpenAI API 的服务（如 Gemini, Doubao 等）

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, ImageDetail, ImageUrl,
    },
    Client,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RunSettings;
use crate::error::{AppError, AppResult, Stage};
use crate::model::StageUsage;

/// VLM 识别提示词：要求模型以 `<wscore>` / `<text>` 标签返回结构化结果
const VLM_PROMPT: &str = r#"# ROLE
You are a high-precision OCR (Optical Character Recognition) and handwriting analysis engine. Your only job is to analyze the provided image and output structured data. Do not add any conversational text or explanations.
# TASK
Analyze the handwriting quality and extract all text from the image.
## 1. Handwriting Quality Analysis:
- Critically evaluate the handwriting on a continuous scale from 0.0 to 1.0.
- The scoring must be stringent. A score of 1.0 is reserved for flawless, machine-printed-like perfection, which is virtually unattainable.
- **Score Tiers:**
    - **0.90-0.99:** Near-perfect, professional calligrapher level. Extremely rare.
    - **0.80-0.89:** Excellent, clear, consistent, and aesthetically pleasing. The best a top student can achieve.
    - **0.70-0.79:** Good and very legible, but with minor inconsistencies in size or spacing.
    - **0.60-0.69:** Clear and legible, but with noticeable inconsistencies.
    - **Below 0.60:** Legibility is impacted.
- Output this score enclosed in a single <wscore> XML tag.
## 2. Full Text Extraction:
- Perform a high-accuracy OCR on the entire image.
- Preserve the original line breaks and paragraph structure as best as possible.
- Output the full extracted text enclosed in a single <text> XML tag.
# OUTPUT FORMAT
Strictly adhere to the following format. Do not output anything else.
<wscore>[Your calculated score, e.g., 0.85]</wscore>
<text>
[The full extracted text from the image goes here.]
</text>"#;

/// VLM 单次调用的 max_tokens 上限
const VLM_MAX_TOKENS: u32 = 4096;

/// VLM 对一张作文图片的分析结果
#[derive(Debug, Clone)]
pub struct VlmAnalysis {
    /// 模型给出的原始书写分（0.0 ~ 1.0）
    pub raw_score: f64,
    /// 识别出的作文全文
    pub text: String,
    /// 本次调用的 token 用量
    pub usage: StageUsage,
}

/// VLM 服务
///
/// 职责：
/// - 将本地图片编码为 Base64 数据 URL
/// - 调用 VLM API 识别手写文本并评估书写质量
/// - 解析 `<wscore>` / `<text>` 标签
/// - 不关心重试、并发和报告生成
pub struct VlmService {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl VlmService {
    pub fn new(settings: &RunSettings) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&settings.vlm_api_key)
            .with_api_base(&settings.vlm_url);

        Self {
            client: Client::with_config(openai_config),
            model: settings.vlm_model.clone(),
            temperature: settings.vlm_temperature,
            timeout: Duration::from_secs_f64(settings.request_timeout_secs),
        }
    }

    /// 分析一张作文图片，返回书写分和识别文本
    ///
    /// 错误分类：
    /// - 网络失败 / 超时：瞬时错误（可重试）
    /// - 图片不存在、类型不可识别、模型未返回 `<text>` 标签：永久错误
    pub async fn analyze_image(&self, image_path: &Path) -> AppResult<VlmAnalysis> {
        let image_url = encode_image_to_data_url(image_path).await?;
        debug!("调用 VLM API，模型: {}", self.model);

        let content_parts: Vec<ChatCompletionRequestUserMessageContentPart> = vec![
            ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartText {
                    text: VLM_PROMPT.to_string(),
                },
            ),
            ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImage {
                    image_url: ImageUrl {
                        url: image_url,
                        detail: Some(ImageDetail::Auto),
                    },
                },
            ),
        ];

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
            .build()
            .map_err(|e| AppError::permanent(Stage::Vlm, format!("构建请求失败: {}", e)))?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![ChatCompletionRequestMessage::User(user_msg)])
            .temperature(self.temperature)
            .max_tokens(VLM_MAX_TOKENS)
            .build()
            .map_err(|e| AppError::permanent(Stage::Vlm, format!("构建请求失败: {}", e)))?;

        let response = match tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("VLM API 调用失败: {}", e);
                return Err(AppError::transient(Stage::Vlm, format!("API 调用失败: {}", e)));
            }
            Err(_) => {
                warn!("VLM API 调用超时（{:.0}秒）", self.timeout.as_secs_f64());
                return Err(AppError::transient(
                    Stage::Vlm,
                    format!("请求超时（{:.0}秒）", self.timeout.as_secs_f64()),
                ));
            }
        };

        let usage = response
            .usage
            .as_ref()
            .map(|u| StageUsage {
                prompt_tokens: u.prompt_tokens as u64,
                completion_tokens: u.completion_tokens as u64,
            })
            .unwrap_or_default();

        let output = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        let (raw_score, text) = parse_vlm_output(&output)?;
        debug!("VLM 识别完成，原始书写分: {:.3}", raw_score);

        Ok(VlmAnalysis {
            raw_score,
            text,
            usage,
        })
    }
}

/// 解析 VLM 返回的 `<wscore>` / `<text>` 标签
///
/// `<wscore>` 缺失或无法解析时按 0.0 处理；`<text>` 缺失是永久错误，
/// 错误信息附带模型原始输出便于排查。
fn parse_vlm_output(output: &str) -> AppResult<(f64, String)> {
    let raw_score = extract_tag(output, "wscore")
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);

    let text = extract_tag(output, "text").ok_or_else(|| {
        AppError::permanent(
            Stage::Vlm,
            format!("VLM未能按预期格式返回，无法解析文本。模型返回：\n{}", output),
        )
    })?;

    Ok((raw_score, text))
}

/// 提取第一个 `<tag>...</tag>` 的内容（跨行匹配），前后空白去除
fn extract_tag(output: &str, tag: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).ok()?;
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// 对原始书写分应用敏感度指数（幂运算）
///
/// 因子非法（非有限或 ≤ 0）时按 1.0 处理，保持分数不变。
/// 分数在 [0, 1] 内时结果仍在 [0, 1] 内。
pub fn apply_sensitivity(raw_score: f64, factor: f64) -> f64 {
    let factor = if factor.is_finite() && factor > 0.0 {
        factor
    } else {
        1.0
    };
    raw_score.powf(factor)
}

/// 将本地图片文件编码为 Base64 数据 URL
async fn encode_image_to_data_url(image_path: &Path) -> AppResult<String> {
    let mime = guess_image_mime(image_path).ok_or_else(|| {
        AppError::permanent(
            Stage::Vlm,
            format!("文件不是可识别的图片类型: {}", image_path.display()),
        )
    })?;

    let bytes = tokio::fs::read(image_path).await.map_err(|e| {
        AppError::permanent(
            Stage::Vlm,
            format!("无法读取图片文件 {}: {}", image_path.display(), e),
        )
    })?;

    Ok(format!("data:{};base64,{}", mime, STANDARD.encode(bytes)))
}

/// 按扩展名推断图片 MIME 类型
fn guess_image_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vlm_output_complete() {
        let output = "<wscore>0.85</wscore>\n<text>\nMy summer holiday was great.\nI went to Beijing.\n</text>";
        let (score, text) = parse_vlm_output(output).unwrap();
        assert!((score - 0.85).abs() < 1e-9);
        assert_eq!(text, "My summer holiday was great.\nI went to Beijing.");
    }

    #[test]
    fn test_parse_vlm_output_missing_score_defaults_to_zero() {
        let output = "<text>hello world</text>";
        let (score, text) = parse_vlm_output(output).unwrap();
        assert_eq!(score, 0.0);
        assert_eq!(text, "hello world");
    }

    #[test]
    fn test_parse_vlm_output_garbage_score_defaults_to_zero() {
        let output = "<wscore>很好</wscore><text>essay</text>";
        let (score, _) = parse_vlm_output(output).unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_parse_vlm_output_missing_text_is_error() {
        let output = "<wscore>0.7</wscore> 抱歉，我无法识别这张图片。";
        let err = parse_vlm_output(output).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("无法解析文本"));
    }

    #[test]
    fn test_apply_sensitivity_identity() {
        assert_eq!(apply_sensitivity(0.8, 1.0), 0.8);
        assert_eq!(apply_sensitivity(0.0, 1.0), 0.0);
        assert_eq!(apply_sensitivity(1.0, 1.0), 1.0);
    }

    #[test]
    fn test_apply_sensitivity_monotonic() {
        // 同一因子下，分高者处理后仍更高
        let factor = 2.5;
        assert!(apply_sensitivity(0.9, factor) > apply_sensitivity(0.6, factor));
        // 因子 > 1 压低中段分数，但不超出 [0, 1]
        let v = apply_sensitivity(0.7, factor);
        assert!(v > 0.0 && v < 0.7);
    }

    #[test]
    fn test_apply_sensitivity_invalid_factor_keeps_score() {
        assert_eq!(apply_sensitivity(0.8, 0.0), 0.8);
        assert_eq!(apply_sensitivity(0.8, -3.0), 0.8);
        assert_eq!(apply_sensitivity(0.8, f64::NAN), 0.8);
    }

    #[test]
    fn test_guess_image_mime() {
        assert_eq!(guess_image_mime(Path::new("a.PNG")), Some("image/png"));
        assert_eq!(guess_image_mime(Path::new("b.jpeg")), Some("image/jpeg"));
        assert_eq!(guess_image_mime(Path::new("c.webp")), Some("image/webp"));
        assert_eq!(guess_image_mime(Path::new("d.txt")), None);
        assert_eq!(guess_image_mime(Path::new("noext")), None);
    }

    #[tokio::test]
    async fn test_encode_rejects_missing_file() {
        let err = encode_image_to_data_url(Path::new("/不存在/essay.png"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    /// 测试 VLM API 连接性（需要真实服务）
    ///
    /// 运行方式：
    /// ```bash
    /// cargo test test_vlm_api_connectivity -- --ignored --nocapture
    /// ```
    #[tokio::test]
    #[ignore]
    async fn test_vlm_api_connectivity() {
        let _ = tracing_subscriber::fmt::try_init();

        let settings = RunSettings {
            vlm_url: std::env::var("VLM_URL").unwrap_or_default(),
            vlm_api_key: std::env::var("VLM_API_KEY").unwrap_or_default(),
            vlm_model: std::env::var("VLM_MODEL").unwrap_or("gemini-2.5-pro".to_string()),
            ..RunSettings::default()
        };
        let service = VlmService::new(&settings);

        let result = service.analyze_image(Path::new("demo_essay.png")).await;
        match result {
            Ok(analysis) => {
                println!("\n========== VLM 识别结果 ==========");
                println!("书写分: {}", analysis.raw_score);
                println!("文本:\n{}", analysis.text);
                println!("==================================\n");
                println!("✅ VLM API 调用成功！");
                assert!(!analysis.text.is_empty());
            }
            Err(e) => {
                println!("❌ VLM API 调用失败: {}", e);
                panic!("测试失败: {}", e);
            }
        }
    }
}
