//! 上下文预算
//!
//! recent_context 按轮数或按 token 数截取最近消息；token 数由外部估算器给出。

use serde::{Deserialize, Serialize};

use super::conversation::Message;

/// Token 估算接口
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// 字符计数近似：英文约 4 字符/token，中文约 1.5 字符/token
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenEstimator;

impl TokenEstimator for HeuristicTokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }
}

/// 最近上下文的预算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextBudget {
    /// 最多 n 条消息
    Turns(usize),
    /// 累计估算 token 不超过 n
    Tokens(usize),
}

impl ContextBudget {
    /// 从末尾向前截取满足预算的后缀，顺序保持旧 → 新
    pub fn select<'a>(&self, messages: &'a [Message], estimator: &dyn TokenEstimator) -> &'a [Message] {
        let start = match *self {
            ContextBudget::Turns(n) => messages.len().saturating_sub(n),
            ContextBudget::Tokens(limit) => {
                let mut used = 0usize;
                let mut start = messages.len();
                for (i, message) in messages.iter().enumerate().rev() {
                    used += estimator.estimate(&message.content);
                    if used > limit {
                        break;
                    }
                    start = i;
                }
                start
            }
        };
        &messages[start..]
    }
}
