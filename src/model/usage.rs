use serde::{Deserialize, Serialize};

/// 单个阶段的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// 两个阶段的累计 token 用量
///
/// 既用于单个文件的用量增量，也用于运行级和全局的累计值。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub vlm_input: u64,
    pub vlm_output: u64,
    pub llm_input: u64,
    pub llm_output: u64,
}

impl UsageTotals {
    /// 由两个阶段的用量合成
    pub fn from_stages(vlm: StageUsage, llm: StageUsage) -> Self {
        Self {
            vlm_input: vlm.prompt_tokens,
            vlm_output: vlm.completion_tokens,
            llm_input: llm.prompt_tokens,
            llm_output: llm.completion_tokens,
        }
    }

    /// 累加另一份用量
    pub fn add(&mut self, other: &UsageTotals) {
        self.vlm_input += other.vlm_input;
        self.vlm_output += other.vlm_output;
        self.llm_input += other.llm_input;
        self.llm_output += other.llm_output;
    }

    pub fn is_zero(&self) -> bool {
        self.vlm_input == 0 && self.vlm_output == 0 && self.llm_input == 0 && self.llm_output == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_accumulates_all_fields() {
        let mut totals = UsageTotals::default();
        totals.add(&UsageTotals {
            vlm_input: 10,
            vlm_output: 20,
            llm_input: 30,
            llm_output: 40,
        });
        totals.add(&UsageTotals {
            vlm_input: 1,
            vlm_output: 2,
            llm_input: 3,
            llm_output: 4,
        });
        assert_eq!(totals.vlm_input, 11);
        assert_eq!(totals.vlm_output, 22);
        assert_eq!(totals.llm_input, 33);
        assert_eq!(totals.llm_output, 44);
    }

    #[test]
    fn test_from_stages() {
        let totals = UsageTotals::from_stages(
            StageUsage {
                prompt_tokens: 5,
                completion_tokens: 6,
            },
            StageUsage {
                prompt_tokens: 7,
                completion_tokens: 8,
            },
        );
        assert_eq!(totals.vlm_input, 5);
        assert_eq!(totals.vlm_output, 6);
        assert_eq!(totals.llm_input, 7);
        assert_eq!(totals.llm_output, 8);
        assert!(!totals.is_zero());
        assert!(UsageTotals::default().is_zero());
    }
}
