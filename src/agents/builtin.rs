//! 内置 Agent
//!
//! - FallbackAgent：保留名、最低优先级，无人能处理时给出澄清回复
//! - EchoAgent / ClockAgent：演示用能力

use async_trait::async_trait;
use chrono::Utc;

use super::traits::{Agent, AgentContext, AgentReply};
use crate::core::AgentError;
use crate::memory::Message;

pub const DEFAULT_FALLBACK_AGENT: &str = "fallback";

/// 兜底 Agent
pub struct FallbackAgent {
    name: String,
}

impl FallbackAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for FallbackAgent {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_AGENT)
    }
}

#[async_trait]
impl Agent for FallbackAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability_tags(&self) -> Vec<String> {
        vec!["fallback".to_string()]
    }

    fn priority(&self) -> i32 {
        i32::MIN
    }

    async fn invoke(&self, message: &Message, _context: &AgentContext) -> Result<AgentReply, AgentError> {
        let content = if message.content.trim().is_empty() {
            "I didn't catch that. What would you like to do?".to_string()
        } else {
            "I'm not sure how to help with that yet. Could you rephrase or add a bit more detail?".to_string()
        };
        Ok(AgentReply::new(content, 0.1).with_metadata("clarification", true))
    }
}

/// 原样复述
pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    fn name(&self) -> &str {
        "echo"
    }

    fn capability_tags(&self) -> Vec<String> {
        vec!["echo".to_string(), "repeat".to_string()]
    }

    async fn invoke(&self, message: &Message, context: &AgentContext) -> Result<AgentReply, AgentError> {
        if context.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let text = message.content.trim();
        let body = ["echo", "repeat"]
            .iter()
            .find_map(|kw| text.strip_prefix(kw))
            .map(str::trim)
            .filter(|rest| !rest.is_empty())
            .unwrap_or(text);
        Ok(AgentReply::new(body, 0.6))
    }
}

/// 报告当前 UTC 时间
pub struct ClockAgent;

#[async_trait]
impl Agent for ClockAgent {
    fn name(&self) -> &str {
        "clock"
    }

    fn capability_tags(&self) -> Vec<String> {
        vec!["time".to_string(), "clock".to_string(), "date".to_string()]
    }

    fn priority(&self) -> i32 {
        1
    }

    async fn invoke(&self, _message: &Message, _context: &AgentContext) -> Result<AgentReply, AgentError> {
        let now = Utc::now();
        Ok(AgentReply::new(
            format!("It is {} UTC.", now.format("%Y-%m-%d %H:%M:%S")),
            0.9,
        )
        .with_metadata("timestamp", now.to_rfc3339()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fallback_is_lowest_priority() {
        let agent = FallbackAgent::default();
        assert_eq!(agent.name(), DEFAULT_FALLBACK_AGENT);
        assert_eq!(agent.priority(), i32::MIN);
        let reply = agent
            .invoke(&Message::user("c", "???"), &AgentContext::new("c"))
            .await
            .unwrap();
        assert!(reply.content.contains("rephrase"));
    }

    #[tokio::test]
    async fn test_echo_strips_keyword() {
        let ctx = AgentContext::new("c");
        let reply = EchoAgent.invoke(&Message::user("c", "echo hello there"), &ctx).await.unwrap();
        assert_eq!(reply.content, "hello there");
        let reply = EchoAgent.invoke(&Message::user("c", "just this"), &ctx).await.unwrap();
        assert_eq!(reply.content, "just this");
    }

    #[tokio::test]
    async fn test_echo_honors_cancellation() {
        let ctx = AgentContext::new("c");
        ctx.cancel.cancel();
        assert_eq!(
            EchoAgent.invoke(&Message::user("c", "hi"), &ctx).await,
            Err(AgentError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_clock_reports_time() {
        let reply = ClockAgent
            .invoke(&Message::user("c", "what time is it"), &AgentContext::new("c"))
            .await
            .unwrap();
        assert!(reply.content.ends_with("UTC."));
        assert!(reply.metadata.contains_key("timestamp"));
    }
}
