pub mod llm;
pub mod vlm;

pub use llm::{LlmReport, LlmService, DEFAULT_LLM_PROMPT_TEMPLATE};
pub use vlm::{apply_sensitivity, VlmAnalysis, VlmService};
