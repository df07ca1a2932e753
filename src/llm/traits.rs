//! LLM 客户端抽象
//!
//! 分类器只需要非流式完成；具体后端（OpenAI 兼容等）由外部实现 LlmClient。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 提示消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

/// 发给 LLM 的单条提示
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM rate limited")]
    RateLimited,
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, LlmError>;

    /// 累计 token 使用：(prompt, completion, total)；默认不统计
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
