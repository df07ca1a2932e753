//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预设回复；脚本耗尽后返回空 JSON 数组。记录收到的每一次提示。

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::{LlmClient, LlmError, PromptMessage};

#[derive(Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<Vec<PromptMessage>>>,
    delay: Option<Duration>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.replies.get_mut().push_back(Ok(reply.into()));
        self
    }

    pub fn with_error(mut self, error: LlmError) -> Self {
        self.replies.get_mut().push_back(Err(error));
        self
    }

    /// 每次完成前等待，用于模拟慢速后端
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn prompts(&self) -> Vec<Vec<PromptMessage>> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, LlmError> {
        self.prompts.lock().await.push(messages.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok("[]".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_replays_script_then_empty_array() {
        let llm = MockLlmClient::new()
            .with_reply("first")
            .with_error(LlmError::RateLimited);
        let prompt = [PromptMessage::user("hi")];
        assert_eq!(llm.complete(&prompt).await.unwrap(), "first");
        assert_eq!(llm.complete(&prompt).await, Err(LlmError::RateLimited));
        assert_eq!(llm.complete(&prompt).await.unwrap(), "[]");
        assert_eq!(llm.prompts().await.len(), 3);
    }
}
