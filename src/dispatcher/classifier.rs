//! 意图分类
//!
//! 分类器返回 `{agent_name, confidence}` 候选，顺序不保证，由 Dispatcher 重新排序。
//! - KeywordClassifier：规则匹配（能力标签 + 额外关键词），不调用 LLM
//! - LlmClassifier：让 LLM 输出 JSON 数组
//! - HybridClassifier：先走规则快速匹配，未命中再调用 LLM

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::agents::AgentDescriptor;
use crate::core::ClassifierError;
use crate::llm::{LlmClient, PromptMessage};
use crate::memory::{Message, Summary};

/// 单个候选（每轮调度产生，用后即弃）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentCandidate {
    pub agent_name: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl IntentCandidate {
    pub fn new(agent_name: impl Into<String>, confidence: f64) -> Self {
        Self {
            agent_name: agent_name.into(),
            confidence,
            rationale: None,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

/// 分类输入
#[derive(Debug, Clone, Copy)]
pub struct ClassificationInput<'a> {
    pub content: &'a str,
    pub recent: &'a [Message],
    pub summary: Option<&'a Summary>,
    /// 当前注册的 Agent（按优先级排序）
    pub agents: &'a [AgentDescriptor],
}

/// 意图分类器接口
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, input: &ClassificationInput<'_>) -> Result<Vec<IntentCandidate>, ClassifierError>;
}

/// 规则分类器：命中关键词数越多置信度越高，`1 - 0.5^hits`
///
/// 每个关键词只编译一次：显式关键词在 with_keywords 时编译，能力标签在首次使用时编译。
#[derive(Debug, Default)]
pub struct KeywordClassifier {
    keywords: HashMap<String, Vec<String>>,
    patterns: RwLock<HashMap<String, Regex>>,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为某个 Agent 增加关键词（能力标签总是作为关键词）
    pub fn with_keywords<I, S>(mut self, agent: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let added: Vec<String> = keywords.into_iter().map(|k| k.into().to_lowercase()).collect();
        {
            let patterns = self.patterns.get_mut().unwrap_or_else(PoisonError::into_inner);
            for keyword in added.iter().filter(|k| !k.trim().is_empty()) {
                if let Ok(regex) = Self::compile(keyword) {
                    patterns.insert(keyword.clone(), regex);
                }
            }
        }
        self.keywords.entry(agent.into()).or_default().extend(added);
        self
    }

    fn keywords_for(&self, descriptor: &AgentDescriptor) -> BTreeSet<String> {
        descriptor
            .capability_tags
            .iter()
            .map(|t| t.to_lowercase())
            .chain(self.keywords.get(&descriptor.name).into_iter().flatten().cloned())
            .filter(|k| !k.trim().is_empty())
            .collect()
    }

    /// ASCII 关键词要求两侧是非单词字符或文本边界（适用于 `c++` 这类以符号结尾的词），
    /// 其余（如中文）按子串匹配
    fn compile(keyword: &str) -> Result<Regex, ClassifierError> {
        let escaped = regex::escape(keyword);
        let pattern = if keyword.is_ascii() {
            format!(r"(?i)(?:^|\W){escaped}(?:\W|$)")
        } else {
            format!("(?i){escaped}")
        };
        Regex::new(&pattern).map_err(|e| ClassifierError::Unavailable(format!("keyword pattern '{keyword}': {e}")))
    }

    fn is_hit(&self, keyword: &str, content: &str) -> Result<bool, ClassifierError> {
        if let Some(regex) = self
            .patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(keyword)
        {
            return Ok(regex.is_match(content));
        }
        let regex = Self::compile(keyword)?;
        let hit = regex.is_match(content);
        self.patterns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(keyword.to_string(), regex);
        Ok(hit)
    }

    /// 已编译的关键词数
    pub fn compiled_count(&self) -> usize {
        self.patterns.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn score(&self, content: &str, descriptor: &AgentDescriptor) -> Result<Option<IntentCandidate>, ClassifierError> {
        let mut matched = Vec::new();
        for keyword in self.keywords_for(descriptor) {
            if self.is_hit(&keyword, content)? {
                matched.push(keyword);
            }
        }
        if matched.is_empty() {
            return Ok(None);
        }
        let confidence = 1.0 - 0.5f64.powi(matched.len() as i32);
        let rationale = format!("matched: {}", matched.join(", "));
        Ok(Some(
            IntentCandidate::new(&descriptor.name, confidence).with_rationale(rationale),
        ))
    }
}

#[async_trait]
impl IntentClassifier for KeywordClassifier {
    async fn classify(&self, input: &ClassificationInput<'_>) -> Result<Vec<IntentCandidate>, ClassifierError> {
        let mut candidates = Vec::new();
        for descriptor in input.agents {
            if let Some(candidate) = self.score(input.content, descriptor)? {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }
}

const ROUTER_PROMPT: &str = r#"You are an intent router for a multi-agent assistant.
Given the conversation and the latest user message, rate how well each available agent can handle the message.

Respond ONLY with a JSON array, no explanation:
[{"agent": "<agent name>", "confidence": <number between 0 and 1>, "rationale": "<short reason>"}]
Only include agents from the list. Return [] if none of them fits."#;

#[derive(Deserialize)]
struct RawCandidate {
    agent: String,
    confidence: f64,
    #[serde(default)]
    rationale: Option<String>,
}

/// LLM 分类器
pub struct LlmClassifier {
    llm: Arc<dyn LlmClient>,
    /// 提示中最多带入的最近消息条数
    max_recent: usize,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm, max_recent: 6 }
    }

    pub fn with_max_recent(mut self, max_recent: usize) -> Self {
        self.max_recent = max_recent;
        self
    }

    fn build_prompt(&self, input: &ClassificationInput<'_>) -> Vec<PromptMessage> {
        let mut system = String::from(ROUTER_PROMPT);
        system.push_str("\n\nAvailable agents:\n");
        for agent in input.agents {
            let tags: Vec<&str> = agent.capability_tags.iter().map(String::as_str).collect();
            system.push_str(&format!("- {}: {}\n", agent.name, tags.join(", ")));
        }

        let mut user = String::new();
        if let Some(summary) = input.summary {
            user.push_str(&format!("Earlier conversation (summary):\n{}\n\n", summary.text));
        }
        let start = input.recent.len().saturating_sub(self.max_recent);
        if start < input.recent.len() {
            user.push_str("Recent turns:\n");
            for m in &input.recent[start..] {
                user.push_str(&format!("{}: {}\n", m.sender, m.content));
            }
            user.push('\n');
        }
        user.push_str(&format!("User message: {}", input.content));

        vec![PromptMessage::system(system), PromptMessage::user(user)]
    }
}

/// 解析 LLM 输出；容忍 ``` 代码块与前后说明文字
pub fn parse_candidates(response: &str) -> Result<Vec<IntentCandidate>, ClassifierError> {
    let start = response.find('[');
    let end = response.rfind(']');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &response[s..=e],
        _ => {
            return Err(ClassifierError::InvalidResponse(format!(
                "no JSON array in response: {}",
                response.chars().take(120).collect::<String>()
            )))
        }
    };
    let raw: Vec<RawCandidate> =
        serde_json::from_str(json).map_err(|e| ClassifierError::InvalidResponse(e.to_string()))?;
    Ok(raw
        .into_iter()
        .map(|r| IntentCandidate {
            agent_name: r.agent,
            confidence: r.confidence,
            rationale: r.rationale,
        })
        .collect())
}

#[async_trait]
impl IntentClassifier for LlmClassifier {
    async fn classify(&self, input: &ClassificationInput<'_>) -> Result<Vec<IntentCandidate>, ClassifierError> {
        let prompt = self.build_prompt(input);
        let response = self
            .llm
            .complete(&prompt)
            .await
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;
        parse_candidates(&response)
    }
}

/// 规则优先、LLM 兜底
pub struct HybridClassifier {
    fast: KeywordClassifier,
    llm: LlmClassifier,
}

impl HybridClassifier {
    pub fn new(fast: KeywordClassifier, llm: LlmClassifier) -> Self {
        Self { fast, llm }
    }
}

#[async_trait]
impl IntentClassifier for HybridClassifier {
    async fn classify(&self, input: &ClassificationInput<'_>) -> Result<Vec<IntentCandidate>, ClassifierError> {
        let fast = self.fast.classify(input).await?;
        if !fast.is_empty() {
            return Ok(fast);
        }
        self.llm.classify(input).await
    }
}
