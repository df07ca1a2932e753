//! 调度器：一轮完整的消息处理
//!
//! 读取上下文 → 意图分类 → 过滤可用候选 → 决定模式 → AgentManager 执行 →
//! 生成出站消息 → 追加入站与出站消息 → 发布到会话回复频道。
//! 同一会话的调度串行执行；基础设施（Memory、Broker）失败只降级，调用方总能拿到回复。
//! 每次记忆层调用与回复发布都有独立超时，超时按对应的失败处理。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::classifier::{ClassificationInput, IntentCandidate, IntentClassifier};
use super::policy::{self, DecisionReason, DispatcherConfig, RoutingDecision};
use crate::agents::{AgentContext, AgentManager, AgentRegistry, DispatchOutcome, DispatchRequest, Task};
use crate::broker::{channel, MessageBroker};
use crate::core::{BrokerError, MemoryError};
use crate::memory::{validate_conversation_id, MemoryManager, Message, Sender, Summary, META_IN_REPLY_TO};

const APOLOGY: &str = "Sorry, I couldn't handle that request right now. Please try again in a moment.";
const INVALID_CONVERSATION: &str = "Sorry, this message has no valid conversation id and was not processed.";

/// 调用方提交的入站消息
#[derive(Debug, Clone)]
pub struct Incoming {
    pub conversation_id: String,
    pub content: String,
    pub participant_id: Option<String>,
    /// 上游已分配的消息 ID（重投时用于去重）
    pub message_id: Option<String>,
}

impl Incoming {
    pub fn new(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            content: content.into(),
            participant_id: None,
            message_id: None,
        }
    }

    pub fn with_participant(mut self, participant_id: impl Into<String>) -> Self {
        self.participant_id = Some(participant_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn into_message(self) -> Message {
        let mut message = Message::user(self.conversation_id, self.content);
        if let Some(id) = self.message_id {
            message = message.with_id(id);
        }
        if let Some(participant) = self.participant_id {
            message = message.with_metadata("participant_id", participant);
        }
        message
    }
}

/// 调度器
pub struct Dispatcher {
    memory: Arc<MemoryManager>,
    registry: Arc<AgentRegistry>,
    manager: Arc<AgentManager>,
    classifier: Arc<dyn IntentClassifier>,
    broker: Arc<MessageBroker>,
    config: DispatcherConfig,
    /// 会话 → 调度锁
    turns: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(
        memory: Arc<MemoryManager>,
        manager: Arc<AgentManager>,
        classifier: Arc<dyn IntentClassifier>,
        broker: Arc<MessageBroker>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            memory,
            registry: Arc::clone(manager.registry()),
            manager,
            classifier,
            broker,
            config,
            turns: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn manager(&self) -> &Arc<AgentManager> {
        &self.manager
    }

    async fn turn_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut turns = self.turns.lock().await;
        Arc::clone(turns.entry(conversation_id.to_string()).or_default())
    }

    /// 没有其他调度在等待时移除会话的调度锁
    async fn release_turn(&self, conversation_id: &str, lock: Arc<Mutex<()>>) {
        let mut turns = self.turns.lock().await;
        // 映射表与本调用各持有一份
        if turns
            .get(conversation_id)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2)
        {
            turns.remove(conversation_id);
        }
    }

    /// 当前持有调度锁的会话数
    pub async fn active_turns(&self) -> usize {
        self.turns.lock().await.len()
    }

    /// 有界的记忆层调用；超时视为持久化失败
    async fn remember<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, MemoryError>>,
    ) -> Result<T, MemoryError> {
        match timeout(self.config.memory_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(MemoryError::Persistence(format!(
                "{operation} timed out after {}ms",
                self.config.memory_timeout_ms
            ))),
        }
    }

    /// 处理调用方提交的入站内容
    pub async fn handle(&self, incoming: Incoming) -> Message {
        self.handle_message(incoming.into_message()).await
    }

    /// 处理一条入站消息，返回出站消息（成功回复、聚合结果或道歉）
    pub async fn handle_message(&self, inbound: Message) -> Message {
        if let Err(e) = validate_conversation_id(&inbound.conversation_id) {
            tracing::warn!(message_id = %inbound.id, error = %e, "inbound rejected");
            return Message::system(&inbound.conversation_id, INVALID_CONVERSATION)
                .with_metadata(META_IN_REPLY_TO, inbound.id.as_str())
                .with_metadata("outcome", "invalid_conversation");
        }

        let conversation_id = inbound.conversation_id.clone();
        let lock = self.turn_lock(&conversation_id).await;
        let outbound = {
            let _turn = lock.lock().await;
            self.run_turn(inbound).await
        };
        self.release_turn(&conversation_id, lock).await;
        outbound
    }

    async fn run_turn(&self, inbound: Message) -> Message {
        let started = Instant::now();
        let conversation_id = inbound.conversation_id.clone();

        let participant = inbound
            .metadata
            .get("participant_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| inbound.sender.as_key());
        if let Err(e) = self
            .remember("ensure_conversation", self.memory.ensure_conversation(&conversation_id, &participant))
            .await
        {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "conversation unavailable, continuing without persistence");
        }

        match self
            .remember("find_reply", self.memory.find_reply(&conversation_id, &inbound.id))
            .await
        {
            Ok(Some(reply)) => {
                tracing::info!(conversation_id = %conversation_id, message_id = %inbound.id, "duplicate inbound, returning stored reply");
                self.publish(&reply).await;
                return reply;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(conversation_id = %conversation_id, error = %e, "reply lookup failed"),
        }

        let recent = self
            .remember("default_context", self.memory.default_context(&conversation_id))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "recent context unavailable");
                Vec::new()
            });
        let summary = self
            .remember("long_term_context", self.memory.long_term_context(&conversation_id))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "long-term context unavailable");
                None
            });

        let (decision, candidates) = self.route(&inbound, &recent, summary.as_ref()).await;
        tracing::debug!(
            conversation_id = %conversation_id,
            mode = decision.mode.as_str(),
            reason = decision.reason.as_str(),
            agents = ?decision.agents,
            "routing decision"
        );

        let context = AgentContext::new(&conversation_id)
            .with_recent(recent)
            .with_summary(summary);
        let request = DispatchRequest::new(inbound.clone(), decision.agents.clone(), decision.mode).with_context(context);
        let outcome = self.manager.dispatch(request).await;

        let outbound = self.build_outbound(&inbound, &decision, &candidates, &outcome, started);

        for message in [inbound.clone(), outbound.clone()] {
            if let Err(e) = self
                .remember("append", self.memory.append(&conversation_id, message))
                .await
            {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "failed to persist turn");
            }
        }
        for task in outcome.tasks() {
            if let Err(e) = self.remember("record_task", self.memory.record_task(task)).await {
                tracing::warn!(task_id = %task.id, error = %e, "failed to record task");
            }
        }

        self.publish(&outbound).await;
        outbound
    }

    /// 分类并决策；分类器失败或超时等同于空候选
    async fn route(
        &self,
        inbound: &Message,
        recent: &[Message],
        summary: Option<&Summary>,
    ) -> (RoutingDecision, Vec<IntentCandidate>) {
        if policy::is_low_signal(&inbound.content, &self.config) {
            return (
                RoutingDecision::fallback(&self.config, DecisionReason::LowSignal),
                Vec::new(),
            );
        }

        let agents = self.registry.list(None).await;
        let input = ClassificationInput {
            content: &inbound.content,
            recent,
            summary,
            agents: &agents,
        };
        let raw = match timeout(self.config.classification_timeout(), self.classifier.classify(&input)).await {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "classifier failed, using fallback");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.classification_timeout_ms,
                    "classifier timed out, using fallback"
                );
                Vec::new()
            }
        };

        let mut available = Vec::new();
        for candidate in policy::sanitize(raw) {
            if self.registry.is_available(&candidate.agent_name).await {
                available.push(candidate);
            } else {
                tracing::debug!(agent = %candidate.agent_name, "dropping unavailable candidate");
            }
        }

        (policy::decide(&available, &self.config), available)
    }

    fn build_outbound(
        &self,
        inbound: &Message,
        decision: &RoutingDecision,
        candidates: &[IntentCandidate],
        outcome: &DispatchOutcome,
        started: Instant,
    ) -> Message {
        let (mut message, confidence, outcome_label) = match outcome {
            DispatchOutcome::Completed { agent, reply, .. } => {
                let mut message = Message::new(&inbound.conversation_id, Sender::agent(agent), &reply.content);
                message.metadata.extend(reply.metadata.clone());
                (message, Some(reply.confidence), "completed")
            }
            DispatchOutcome::NoAgentAvailable { .. } => (
                Message::system(&inbound.conversation_id, APOLOGY),
                None,
                "no_agent_available",
            ),
        };

        let intent = candidates
            .first()
            .map(|c| Value::from(c.agent_name.as_str()))
            .unwrap_or(Value::Null);
        let attempts: Vec<Value> = outcome.tasks().iter().map(attempt_json).collect();
        let candidates: Vec<Value> = candidates
            .iter()
            .map(|c| json!({ "agent": c.agent_name, "confidence": c.confidence }))
            .collect();

        let metadata = &mut message.metadata;
        metadata.insert(META_IN_REPLY_TO.to_string(), Value::from(inbound.id.as_str()));
        metadata.insert("mode".to_string(), Value::from(decision.mode.as_str()));
        metadata.insert("reason".to_string(), Value::from(decision.reason.as_str()));
        metadata.insert("intent".to_string(), intent);
        metadata.insert("confidence".to_string(), confidence.map(Value::from).unwrap_or(Value::Null));
        metadata.insert("latency_ms".to_string(), Value::from(started.elapsed().as_millis() as u64));
        metadata.insert("candidates".to_string(), Value::Array(candidates));
        metadata.insert("outcome".to_string(), Value::from(outcome_label));
        metadata.insert("attempts".to_string(), Value::Array(attempts));
        message
    }

    async fn publish(&self, outbound: &Message) {
        let channel = channel::response(&outbound.conversation_id);
        let result = match timeout(self.config.publish_timeout(), self.broker.publish_message(&channel, outbound)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(BrokerError::BrokerUnavailable {
                channel: channel.clone(),
                attempts: 0,
                reason: format!("publish timed out after {}ms", self.config.publish_timeout_ms),
            }),
        };
        if let Err(e) = result {
            tracing::warn!(channel = %channel, message_id = %outbound.id, error = %e, "failed to publish reply");
        }
    }

    /// 取消会话内进行中的 Agent 调用
    pub async fn cancel(&self, conversation_id: &str) -> usize {
        self.manager.cancel_conversation(conversation_id).await
    }
}

fn attempt_json(task: &Task) -> Value {
    json!({
        "agent": task.assigned_agent,
        "status": task.status.as_str(),
        "error": task.error.as_ref().map(|e| e.message.as_str()),
    })
}
