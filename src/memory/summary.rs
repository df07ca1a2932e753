//! 长期上下文摘要
//!
//! Summarizer 把上一次摘要与新增的较早消息折叠为新摘要；具体算法由外部提供。
//! 默认实现按行拼接并保留末尾若干字符。

use async_trait::async_trait;

use super::conversation::{Message, Summary};
use crate::core::MemoryError;

/// 摘要器接口
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// previous 为当前摘要（可能为空），messages 为其后新纳入摘要的消息
    async fn summarize(&self, previous: Option<&Summary>, messages: &[Message]) -> Result<String, MemoryError>;
}

/// 截断式摘要：`sender: content` 逐行拼接，超过上限时保留最新部分
#[derive(Debug, Clone)]
pub struct TruncatingSummarizer {
    max_chars: usize,
}

impl TruncatingSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }
}

impl Default for TruncatingSummarizer {
    fn default() -> Self {
        Self::new(1200)
    }
}

#[async_trait]
impl Summarizer for TruncatingSummarizer {
    async fn summarize(&self, previous: Option<&Summary>, messages: &[Message]) -> Result<String, MemoryError> {
        let mut text = previous.map(|s| s.text.clone()).unwrap_or_default();
        for message in messages {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!("{}: {}", message.sender, message.content.trim()));
        }

        let total = text.chars().count();
        if total <= self.max_chars {
            return Ok(text);
        }
        let tail: String = text.chars().skip(total - self.max_chars + 1).collect();
        Ok(format!("…{tail}"))
    }
}
