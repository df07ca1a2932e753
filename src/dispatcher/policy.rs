//! 路由策略：候选清洗、低信息量输入判定、single / broadcast 决策

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::classifier::IntentCandidate;
use crate::agents::{DispatchMode, DEFAULT_FALLBACK_AGENT};

/// 比较置信度差值时的浮点容差
const MARGIN_TOLERANCE: f64 = 1e-9;

/// 分类器实现选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    Keyword,
    Llm,
    Hybrid,
}

/// [dispatcher] 段
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// single 模式要求最高置信度严格大于该阈值
    pub confidence_threshold: f64,
    /// single 模式要求 top − second 不小于该值
    pub margin: f64,
    /// |top − second| 小于该值视为平局，强制 broadcast
    pub tie_epsilon: f64,
    /// broadcast / 顺序回退的候选上限
    pub top_k: usize,
    /// 少于该字符数直接交给兜底 Agent
    pub min_content_chars: usize,
    /// 字符香农熵（bit）低于该值直接交给兜底 Agent
    pub min_entropy_bits: f64,
    pub classification_timeout_ms: u64,
    /// 单次记忆层调用（读写会话、记录 Task）的超时
    pub memory_timeout_ms: u64,
    /// 发布回复的超时（含总线内部重试）
    pub publish_timeout_ms: u64,
    /// 入站监听中会话邮箱的空闲回收时间
    pub mailbox_idle_ms: u64,
    /// 保留的兜底 Agent 名称
    pub fallback_agent: String,
    pub classifier: ClassifierKind,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            margin: 0.15,
            tie_epsilon: 0.01,
            top_k: 3,
            min_content_chars: 2,
            min_entropy_bits: 0.9,
            classification_timeout_ms: 5_000,
            memory_timeout_ms: 2_000,
            publish_timeout_ms: 5_000,
            mailbox_idle_ms: 60_000,
            fallback_agent: DEFAULT_FALLBACK_AGENT.to_string(),
            classifier: ClassifierKind::Keyword,
        }
    }
}

impl DispatcherConfig {
    pub fn classification_timeout(&self) -> Duration {
        Duration::from_millis(self.classification_timeout_ms)
    }

    pub fn memory_timeout(&self) -> Duration {
        Duration::from_millis(self.memory_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn mailbox_idle(&self) -> Duration {
        Duration::from_millis(self.mailbox_idle_ms)
    }
}

/// 决策原因（写入出站消息元数据）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// 输入过短或信息量过低，未分类
    LowSignal,
    /// 分类器无结果、不可用，或候选均不可用
    NoCandidates,
    /// 最高置信度超过阈值且领先足够
    Confident,
    /// 前两名置信度几乎相同
    Tie,
    /// 最高置信度未超过阈值
    LowConfidence,
    /// 领先幅度不足
    NarrowMargin,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::LowSignal => "low_signal",
            DecisionReason::NoCandidates => "no_candidates",
            DecisionReason::Confident => "confident",
            DecisionReason::Tie => "tie",
            DecisionReason::LowConfidence => "low_confidence",
            DecisionReason::NarrowMargin => "narrow_margin",
        }
    }
}

/// 路由决策
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub mode: DispatchMode,
    /// 交给 AgentManager 的有序候选
    pub agents: Vec<String>,
    pub reason: DecisionReason,
}

impl RoutingDecision {
    pub fn fallback(config: &DispatcherConfig, reason: DecisionReason) -> Self {
        Self {
            mode: DispatchMode::Single,
            agents: vec![config.fallback_agent.clone()],
            reason,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.reason, DecisionReason::LowSignal | DecisionReason::NoCandidates)
    }
}

/// 清洗分类器输出：丢弃非有限值，截断到 [0,1]，同名合并取最大值，
/// 按置信度降序、名称升序排列
pub fn sanitize(candidates: Vec<IntentCandidate>) -> Vec<IntentCandidate> {
    let mut merged: HashMap<String, IntentCandidate> = HashMap::new();
    for mut candidate in candidates {
        if !candidate.confidence.is_finite() || candidate.agent_name.trim().is_empty() {
            continue;
        }
        candidate.confidence = candidate.confidence.clamp(0.0, 1.0);
        match merged.get(&candidate.agent_name) {
            Some(existing) if existing.confidence >= candidate.confidence => {}
            _ => {
                merged.insert(candidate.agent_name.clone(), candidate);
            }
        }
    }
    let mut ranked: Vec<IntentCandidate> = merged.into_values().collect();
    rank(&mut ranked);
    ranked
}

pub fn rank(candidates: &mut [IntentCandidate]) {
    candidates.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.agent_name.cmp(&b.agent_name))
    });
}

/// 按字符统计的香农熵（bit）
pub fn shannon_entropy(text: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for c in text.chars().filter(|c| !c.is_whitespace()) {
        *counts.entry(c).or_default() += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}

/// 过短或信息量过低的输入
pub fn is_low_signal(content: &str, config: &DispatcherConfig) -> bool {
    let trimmed = content.trim();
    trimmed.chars().count() < config.min_content_chars || shannon_entropy(trimmed) < config.min_entropy_bits
}

/// 根据已排序、已过滤的候选决定调度模式
pub fn decide(ranked: &[IntentCandidate], config: &DispatcherConfig) -> RoutingDecision {
    let Some(top) = ranked.first() else {
        return RoutingDecision::fallback(config, DecisionReason::NoCandidates);
    };
    let top_k = config.top_k.max(1);
    let shortlist: Vec<String> = ranked.iter().take(top_k).map(|c| c.agent_name.clone()).collect();

    let second = ranked.get(1).map(|c| c.confidence);
    let delta = top.confidence - second.unwrap_or(0.0);

    if second.is_some() && delta.abs() < config.tie_epsilon {
        return RoutingDecision {
            mode: DispatchMode::Broadcast,
            agents: shortlist,
            reason: DecisionReason::Tie,
        };
    }

    if top.confidence > config.confidence_threshold && delta >= config.margin - MARGIN_TOLERANCE {
        return RoutingDecision {
            mode: DispatchMode::Single,
            agents: shortlist,
            reason: DecisionReason::Confident,
        };
    }

    RoutingDecision {
        mode: DispatchMode::Broadcast,
        agents: shortlist,
        reason: if top.confidence > config.confidence_threshold {
            DecisionReason::NarrowMargin
        } else {
            DecisionReason::LowConfidence
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(pairs: &[(&str, f64)]) -> Vec<IntentCandidate> {
        sanitize(pairs.iter().map(|(n, c)| IntentCandidate::new(*n, *c)).collect())
    }

    #[test]
    fn test_clear_winner_is_single() {
        let config = DispatcherConfig::default();
        let decision = decide(&ranked(&[("search", 0.3), ("weather", 0.9)]), &config);
        assert_eq!(decision.mode, DispatchMode::Single);
        assert_eq!(decision.agents[0], "weather");
        assert_eq!(decision.reason, DecisionReason::Confident);
    }

    #[test]
    fn test_close_scores_broadcast() {
        let config = DispatcherConfig::default();
        let decision = decide(&ranked(&[("weather", 0.55), ("search", 0.53)]), &config);
        assert_eq!(decision.mode, DispatchMode::Broadcast);
        assert_eq!(decision.agents, vec!["weather", "search"]);
        assert_eq!(decision.reason, DecisionReason::LowConfidence);
    }

    #[test]
    fn test_margin_boundary_and_ties() {
        let config = DispatcherConfig::default();
        // 恰好等于 margin 仍为 single
        let exact = decide(&ranked(&[("a", 0.8), ("b", 0.65)]), &config);
        assert_eq!(exact.mode, DispatchMode::Single);

        let narrow = decide(&ranked(&[("a", 0.8), ("b", 0.7)]), &config);
        assert_eq!(narrow.reason, DecisionReason::NarrowMargin);

        let tie = decide(&ranked(&[("a", 0.95), ("b", 0.945), ("c", 0.1), ("d", 0.05)]), &config);
        assert_eq!(tie.mode, DispatchMode::Broadcast);
        assert_eq!(tie.reason, DecisionReason::Tie);
        assert_eq!(tie.agents, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_single_candidate_above_threshold() {
        let config = DispatcherConfig::default();
        let decision = decide(&ranked(&[("clock", 0.75)]), &config);
        assert_eq!(decision.mode, DispatchMode::Single);
        let weak = decide(&ranked(&[("clock", 0.5)]), &config);
        assert_eq!(weak.mode, DispatchMode::Broadcast);
    }

    #[test]
    fn test_empty_goes_to_fallback() {
        let config = DispatcherConfig::default();
        let decision = decide(&[], &config);
        assert_eq!(decision.agents, vec!["fallback"]);
        assert_eq!(decision.mode, DispatchMode::Single);
        assert!(decision.is_fallback());
    }

    #[test]
    fn test_sanitize_clamps_merges_and_drops() {
        let cleaned = sanitize(vec![
            IntentCandidate::new("a", 1.7),
            IntentCandidate::new("b", f64::NAN),
            IntentCandidate::new("c", -0.2),
            IntentCandidate::new("c", 0.4),
            IntentCandidate::new("", 0.9),
        ]);
        let pairs: Vec<_> = cleaned.iter().map(|c| (c.agent_name.as_str(), c.confidence)).collect();
        assert_eq!(pairs, vec![("a", 1.0), ("c", 0.4)]);
    }

    #[test]
    fn test_low_signal() {
        let config = DispatcherConfig::default();
        assert!(is_low_signal("", &config));
        assert!(is_low_signal("?", &config));
        assert!(is_low_signal("aaaaaa", &config));
        assert!(!is_low_signal("hi", &config));
        assert!(!is_low_signal("what's the weather", &config));
        assert!((shannon_entropy("abab") - 1.0).abs() < 1e-9);
    }
}
