//! LLM 服务 - 业务能力层
//!
//! 只负责"根据识别文本生成批改报告"能力，不关心流程
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 支持自定义 API 端点和模型
//! - 支持用户自定义提示词模板（占位符 `{topic}` / `{wscore}` / `{essay_text}`）

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RunSettings;
use crate::error::{AppError, AppResult, Stage};
use crate::model::StageUsage;

/// 内置批改提示词模板
///
/// 通过设置项 `LlmPromptTemplate` 可整体替换；占位符用
/// [`fill_template`] 做纯文本替换，不做格式校验。
pub const DEFAULT_LLM_PROMPT_TEMPLATE: &str = r#"# ESSAY TOPIC
{topic}

# INSTRUCTIONS FOR AI (Process in English)
## 1. ROLE & GOAL
You are a highly experienced senior high school English teacher. Your task is to provide a detailed, constructive, and encouraging evaluation of a student's essay.
## 2. INPUT DATA
You will receive a quantitative `<wscore>` and the full `<text>` of the essay. The essay is based on the topic provided above.
## 3. GRADING LOGIC (Total Score: 15 points)
- **Content & Language (12 points):** Evaluate this based on grammar, vocabulary, sentence structure, etc., in relation to the essay topic.
- **Handwriting & Presentation (3 points):** Calculate the score by first getting a raw score (`Raw Score = wscore * 3`), and then rounding the `Raw Score` **up** to the nearest half-point (0.5).
    - *Rounding Logic Example:* A raw score of 2.49 becomes 2.5. A raw score of 2.51 becomes 3.0. A raw score of 2.50 remains 2.5. A score of 0 remains 0.
## 4. FINAL TASK
Analyze the text, calculate scores, and present your feedback in **Simplified Chinese** using the precise Markdown format specified below.
#--- End of English Instructions ---
# OUTPUT SPECIFICATION (MUST BE IN SIMPLIFIED CHINESE)
# 请严格使用以下Markdown格式，并用简体中文填充所有内容，优点可以两个到三个，问题建议要把全部问题找出来并且解析，都要遵循类似格式。


###【作文内容】
*   **作文文本:** [在此处粘贴完整的作文文本。]
### 【综合评价】
(在此处用一两句鼓励性的话，对本次作文进行总体概述。)
### 【亮点与优点】
*   **(优点1):** [具体描述作文内容或语言上的一个亮点。]
*   **(优点2):** [具体描述另一个优点。]
*   **(优点3):（以此类推，不限制数量，但建议控制在3个以内。）
### 【问题与修改建议】
*   **[问题1 - 语法/拼写错误]:**
    *   **原文句子:** "[引用出现错误的原文句子]"
    *   **问题分析:** [简要说明错误类型。]
    *   **修改建议:** "[写出修改后的正确句子]"
*   **[问题2 - 表达/逻辑]:**
    *   **原文句子:** "[引用表达欠佳的原文句子]"
    *   **问题分析:** [说明问题所在。]
    *   **修改建议:** "[提供一个更好的表达方式。]
*   **[问题3 - （以此类推，不限制数量，但建议控制在3个以内。）]:**
    *   **原文句子:** "[说明问题所在。]"
    *   **问题分析:** [说明问题所在。]
### 【分数评估】
*   **内容与语言分 (Content & Language):** [分数] / 12
*   **卷面与书写分 (Handwriting & Presentation):** [分数] / 3
*   ---
*   **最终得分 (Final Score):** **[总分] / 15**

# INPUT DATA FOR THIS TASK

<wscore>{wscore}</wscore>
<text>
{essay_text}
</text>
"#;

/// LLM 单次调用的 max_tokens 上限（报告较长）
const LLM_MAX_TOKENS: u32 = 16384;

/// LLM 生成的批改报告
#[derive(Debug, Clone)]
pub struct LlmReport {
    /// Markdown 格式的完整报告
    pub report: String,
    /// 本次调用的 token 用量
    pub usage: StageUsage,
}

/// LLM 服务
///
/// 职责：
/// - 用模板拼装最终提示词
/// - 调用 LLM API 生成批改报告
/// - 不关心重试、并发和文件落盘
pub struct LlmService {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    timeout: Duration,
    template: String,
}

impl LlmService {
    pub fn new(settings: &RunSettings) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&settings.llm_api_key)
            .with_api_base(&settings.llm_url);

        Self {
            client: Client::with_config(openai_config),
            model: settings.llm_model.clone(),
            temperature: settings.llm_temperature,
            timeout: Duration::from_secs_f64(settings.request_timeout_secs),
            template: settings
                .prompt_template
                .clone()
                .unwrap_or_else(|| DEFAULT_LLM_PROMPT_TEMPLATE.to_string()),
        }
    }

    /// 根据作文题目、书写分和识别文本生成批改报告
    ///
    /// 错误分类：网络失败 / 超时为瞬时错误；模型返回空内容为永久错误。
    pub async fn generate_report(
        &self,
        topic: &str,
        wscore: f64,
        essay_text: &str,
    ) -> AppResult<LlmReport> {
        let prompt = fill_template(&self.template, topic, wscore, essay_text);
        debug!("调用 LLM API，模型: {}，提示词 {} 字符", self.model, prompt.len());

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()
            .map_err(|e| AppError::permanent(Stage::Llm, format!("构建请求失败: {}", e)))?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![ChatCompletionRequestMessage::User(user_msg)])
            .temperature(self.temperature)
            .max_tokens(LLM_MAX_TOKENS)
            .build()
            .map_err(|e| AppError::permanent(Stage::Llm, format!("构建请求失败: {}", e)))?;

        let response = match tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("LLM API 调用失败: {}", e);
                return Err(AppError::transient(Stage::Llm, format!("API 调用失败: {}", e)));
            }
            Err(_) => {
                warn!("LLM API 调用超时（{:.0}秒）", self.timeout.as_secs_f64());
                return Err(AppError::transient(
                    Stage::Llm,
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

        let report = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        if report.trim().is_empty() {
            return Err(AppError::permanent(Stage::Llm, "AI未能生成报告".to_string()));
        }

        debug!("LLM 报告生成完成，{} 字符", report.len());
        Ok(LlmReport { report, usage })
    }
}

/// 填充提示词模板的三个占位符
///
/// 纯文本替换，模板缺少某个占位符时对应数据静默忽略。
fn fill_template(template: &str, topic: &str, wscore: f64, essay_text: &str) -> String {
    template
        .replace("{topic}", topic)
        .replace("{wscore}", &wscore.to_string())
        .replace("{essay_text}", essay_text)
}
