//! Agent 管理器：执行候选 Agent 并聚合结果
//!
//! - single：按候选顺序逐个尝试，首个成功即停止
//! - broadcast：并发调用全部候选，等待全部进入终态（或超时）后按
//!   置信度降序 → 注册优先级降序 → 名称升序 选出胜者
//!
//! 每次调用都在独立的 tokio 任务中运行：领域错误与 panic 只影响自身 Task。
//! 单次调用的期限为 `min(单次超时, 本轮调度剩余预算)`，超时后取消令牌并中止任务。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use super::metrics::AgentMetrics;
use super::registry::{AgentDescriptor, AgentRegistry};
use super::task::{Task, TaskError, TaskErrorKind, TaskKey, TaskLedger, TaskStatus};
use super::traits::{AgentContext, AgentReply};
use crate::broker::{channel, MessageBroker};
use crate::core::AgentError;
use crate::memory::Message;

/// [agents] 段
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentManagerConfig {
    /// 单次调用超时（毫秒）
    pub invocation_timeout_ms: u64,
    /// 一轮调度的总预算（毫秒），约束 single 模式的顺序回退
    pub dispatch_budget_ms: u64,
    /// 内存中保留的最近终态 Task 数
    pub task_history: usize,
    /// shutdown 时等待进行中 Task 收尾的上限（毫秒）
    pub shutdown_grace_ms: u64,
    /// 周期性健康检查的间隔（毫秒），0 表示不检查
    pub health_check_interval_ms: u64,
}

impl Default for AgentManagerConfig {
    fn default() -> Self {
        Self {
            invocation_timeout_ms: 10_000,
            dispatch_budget_ms: 15_000,
            task_history: 256,
            shutdown_grace_ms: 1_000,
            health_check_interval_ms: 30_000,
        }
    }
}

impl AgentManagerConfig {
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    pub fn dispatch_budget(&self) -> Duration {
        Duration::from_millis(self.dispatch_budget_ms)
    }
}

/// 调度模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Single,
    Broadcast,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Single => "single",
            DispatchMode::Broadcast => "broadcast",
        }
    }
}

/// 一次调度请求
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub conversation_id: String,
    pub message: Message,
    /// 已排序的候选 Agent 名称
    pub candidates: Vec<String>,
    pub mode: DispatchMode,
    /// 传给 Agent 的上下文；取消令牌由管理器为每个 Task 重新派生
    pub context: AgentContext,
}

impl DispatchRequest {
    pub fn new(message: Message, candidates: Vec<String>, mode: DispatchMode) -> Self {
        let conversation_id = message.conversation_id.clone();
        Self {
            context: AgentContext::new(&conversation_id),
            conversation_id,
            message,
            candidates,
            mode,
        }
    }

    pub fn with_context(mut self, context: AgentContext) -> Self {
        self.context = context;
        self
    }
}

/// 调度结果；没有候选成功不是错误，而是 NoAgentAvailable
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Completed {
        agent: String,
        reply: AgentReply,
        /// 本轮全部 Task（按候选顺序）
        tasks: Vec<Task>,
    },
    NoAgentAvailable {
        /// 按候选顺序的失败尝试
        attempts: Vec<Task>,
        /// 未注册、不健康或同键已在执行而被跳过的候选
        skipped: Vec<String>,
    },
}

impl DispatchOutcome {
    pub fn tasks(&self) -> &[Task] {
        match self {
            DispatchOutcome::Completed { tasks, .. } => tasks,
            DispatchOutcome::NoAgentAvailable { attempts, .. } => attempts,
        }
    }

    pub fn winner(&self) -> Option<&str> {
        match self {
            DispatchOutcome::Completed { agent, .. } => Some(agent),
            DispatchOutcome::NoAgentAvailable { .. } => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DispatchOutcome::Completed { .. })
    }
}

/// Agent 管理器
pub struct AgentManager {
    registry: Arc<AgentRegistry>,
    ledger: TaskLedger,
    config: AgentManagerConfig,
    /// 根令牌 → 会话令牌 → Task 令牌
    root: CancellationToken,
    conversations: Mutex<HashMap<String, CancellationToken>>,
    history: Mutex<VecDeque<Task>>,
    metrics: Mutex<HashMap<String, AgentMetrics>>,
    broker: Option<Arc<MessageBroker>>,
}

impl AgentManager {
    pub fn new(registry: Arc<AgentRegistry>, config: AgentManagerConfig) -> Self {
        Self {
            registry,
            ledger: TaskLedger::new(),
            config,
            root: CancellationToken::new(),
            conversations: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            metrics: Mutex::new(HashMap::new()),
            broker: None,
        }
    }

    /// 挂接总线后，每个终态 Task 发布到 `conversation.<id>.tasks`
    pub fn with_broker(mut self, broker: Arc<MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &AgentManagerConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    async fn conversation_token(&self, conversation_id: &str) -> CancellationToken {
        let mut conversations = self.conversations.lock().await;
        match conversations.get(conversation_id) {
            Some(token) if !token.is_cancelled() => token.clone(),
            _ => {
                let token = self.root.child_token();
                conversations.insert(conversation_id.to_string(), token.clone());
                token
            }
        }
    }

    /// 执行一轮调度
    pub async fn dispatch(&self, request: DispatchRequest) -> DispatchOutcome {
        let deadline = Instant::now() + self.config.dispatch_budget();
        let parent = self.conversation_token(&request.conversation_id).await;

        let mut skipped = Vec::new();
        let mut resolved: Vec<AgentDescriptor> = Vec::new();
        let mut seen = HashSet::new();
        for name in &request.candidates {
            if !seen.insert(name.as_str()) {
                continue;
            }
            match self.registry.get(name).await {
                Some(d) if d.healthy => resolved.push(d),
                Some(_) => {
                    tracing::warn!(agent = %name, "skipping unhealthy agent");
                    skipped.push(name.clone());
                }
                None => {
                    tracing::warn!(agent = %name, "skipping unknown agent");
                    skipped.push(name.clone());
                }
            }
        }

        if self.is_shut_down() {
            tracing::warn!(conversation_id = %request.conversation_id, "dispatch after shutdown");
            skipped.extend(resolved.into_iter().map(|d| d.name));
            return DispatchOutcome::NoAgentAvailable {
                attempts: Vec::new(),
                skipped,
            };
        }

        tracing::debug!(
            conversation_id = %request.conversation_id,
            mode = request.mode.as_str(),
            candidates = ?resolved.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            "dispatching"
        );

        let outcome = match request.mode {
            DispatchMode::Single => self.dispatch_single(&request, resolved, skipped, &parent, deadline).await,
            DispatchMode::Broadcast => {
                self.dispatch_broadcast(&request, resolved, skipped, &parent, deadline)
                    .await
            }
        };
        self.release_conversation(&request.conversation_id).await;
        outcome
    }

    /// 会话没有进行中的 Task 时丢弃其令牌，下一轮重新派生
    async fn release_conversation(&self, conversation_id: &str) {
        if self.ledger.has_conversation(conversation_id).await {
            return;
        }
        self.conversations.lock().await.remove(conversation_id);
    }

    /// 当前持有取消令牌的会话数
    pub async fn tracked_conversations(&self) -> usize {
        self.conversations.lock().await.len()
    }

    async fn dispatch_single(
        &self,
        request: &DispatchRequest,
        resolved: Vec<AgentDescriptor>,
        mut skipped: Vec<String>,
        parent: &CancellationToken,
        deadline: Instant,
    ) -> DispatchOutcome {
        let mut tasks = Vec::new();
        for descriptor in resolved {
            if Instant::now() >= deadline || parent.is_cancelled() {
                tracing::warn!(agent = %descriptor.name, "dispatch budget exhausted, skipping candidate");
                skipped.push(descriptor.name);
                continue;
            }
            let Some(task) = self.run_task(&descriptor, request, parent, deadline).await else {
                skipped.push(descriptor.name);
                continue;
            };
            let succeeded = task.status == TaskStatus::Succeeded;
            let reply = task.result.clone();
            tasks.push(task);
            if let (true, Some(reply)) = (succeeded, reply) {
                return DispatchOutcome::Completed {
                    agent: descriptor.name,
                    reply,
                    tasks,
                };
            }
        }
        DispatchOutcome::NoAgentAvailable {
            attempts: tasks,
            skipped,
        }
    }

    async fn dispatch_broadcast(
        &self,
        request: &DispatchRequest,
        resolved: Vec<AgentDescriptor>,
        mut skipped: Vec<String>,
        parent: &CancellationToken,
        deadline: Instant,
    ) -> DispatchOutcome {
        let runs = resolved
            .iter()
            .map(|descriptor| self.run_task(descriptor, request, parent, deadline));
        let results = join_all(runs).await;

        let mut tasks = Vec::new();
        let mut succeeded: Vec<(&AgentDescriptor, AgentReply)> = Vec::new();
        for (descriptor, result) in resolved.iter().zip(results) {
            match result {
                Some(task) => {
                    if let (TaskStatus::Succeeded, Some(reply)) = (task.status, task.result.clone()) {
                        succeeded.push((descriptor, reply));
                    }
                    tasks.push(task);
                }
                None => skipped.push(descriptor.name.clone()),
            }
        }

        succeeded.sort_by(|(da, ra), (db, rb)| {
            rb.confidence
                .total_cmp(&ra.confidence)
                .then_with(|| db.priority.cmp(&da.priority))
                .then_with(|| da.name.cmp(&db.name))
        });

        match succeeded.into_iter().next() {
            Some((descriptor, reply)) => DispatchOutcome::Completed {
                agent: descriptor.name.clone(),
                reply,
                tasks,
            },
            None => DispatchOutcome::NoAgentAvailable {
                attempts: tasks,
                skipped,
            },
        }
    }

    /// 运行单个 Task；同键已有进行中 Task 时返回 None
    async fn run_task(
        &self,
        descriptor: &AgentDescriptor,
        request: &DispatchRequest,
        parent: &CancellationToken,
        deadline: Instant,
    ) -> Option<Task> {
        let key = TaskKey::new(&request.conversation_id, &request.message.id, &descriptor.name);
        let token = parent.child_token();
        let Some(mut task) = self.ledger.begin(&key, token.clone()).await else {
            tracing::warn!(agent = %descriptor.name, message_id = %request.message.id, "task already in flight, skipping");
            return None;
        };

        let limit = self
            .config
            .invocation_timeout()
            .min(deadline.saturating_duration_since(Instant::now()));

        let agent = Arc::clone(&descriptor.handler);
        let message = request.message.clone();
        let mut context = request.context.clone();
        context.cancel = token.clone();

        settle(&mut task, |t| t.start());
        let mut handle = tokio::spawn(async move { agent.invoke(&message, &context).await });

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                handle.abort();
                settle(&mut task, |t| t.time_out(TaskError::new(TaskErrorKind::Cancelled, "invocation cancelled")));
            }
            joined = &mut handle => match joined {
                Ok(Ok(reply)) => settle(&mut task, |t| t.succeed(reply)),
                Ok(Err(AgentError::Cancelled)) => settle(&mut task, |t| {
                    t.time_out(TaskError::new(TaskErrorKind::Cancelled, AgentError::Cancelled.to_string()))
                }),
                Ok(Err(AgentError::Unavailable(reason))) => {
                    tracing::warn!(agent = %descriptor.name, reason = %reason, "agent reported itself unavailable");
                    // 由下一次健康检查恢复
                    let _ = self.registry.set_health(&descriptor.name, false).await;
                    settle(&mut task, |t| {
                        t.fail(TaskError::new(
                            TaskErrorKind::AgentInvocation,
                            AgentError::Unavailable(reason).to_string(),
                        ))
                    })
                }
                Ok(Err(e)) => settle(&mut task, |t| t.fail(TaskError::new(TaskErrorKind::AgentInvocation, e.to_string()))),
                Err(join_error) if join_error.is_panic() => {
                    tracing::error!(agent = %descriptor.name, "agent panicked");
                    settle(&mut task, |t| t.fail(TaskError::new(TaskErrorKind::Panicked, "agent panicked")))
                }
                Err(join_error) => settle(&mut task, |t| {
                    t.fail(TaskError::new(TaskErrorKind::Cancelled, join_error.to_string()))
                }),
            },
            _ = sleep(limit) => {
                token.cancel();
                handle.abort();
                settle(&mut task, |t| {
                    t.time_out(TaskError::new(
                        TaskErrorKind::Timeout,
                        format!("no reply within {}ms", limit.as_millis()),
                    ))
                });
            }
        }

        self.ledger.finish(&task).await;
        self.observe(&task).await;
        Some(task)
    }

    /// 审计日志、历史记录、任务事件
    async fn observe(&self, task: &Task) {
        let audit = serde_json::json!({
            "event": "task_audit",
            "task_id": task.id,
            "conversation_id": task.conversation_id,
            "message_id": task.originating_message_id,
            "agent": task.assigned_agent,
            "status": task.status.as_str(),
            "duration_ms": task.duration_ms(),
            "confidence": task.confidence(),
            "error_kind": task.error.as_ref().map(|e| e.kind),
            "error": task.error.as_ref().map(|e| e.message.as_str()),
        });
        tracing::info!(audit = %audit.to_string(), "task");

        self.metrics
            .lock()
            .await
            .entry(task.assigned_agent.clone())
            .or_default()
            .record(
                task.duration_ms().unwrap_or_default().max(0) as u64,
                task.status == TaskStatus::Succeeded,
            );

        {
            let mut history = self.history.lock().await;
            history.push_back(task.clone());
            while history.len() > self.config.task_history {
                history.pop_front();
            }
        }

        if let Some(broker) = &self.broker {
            if let Err(e) = broker
                .publish_json(&channel::task_events(&task.conversation_id), task)
                .await
            {
                tracing::warn!(task_id = %task.id, error = %e, "failed to publish task event");
            }
        }
    }

    /// 取消会话的所有进行中 Task，返回取消数量
    pub async fn cancel_conversation(&self, conversation_id: &str) -> usize {
        if let Some(token) = self.conversations.lock().await.remove(conversation_id) {
            token.cancel();
        }
        let cancelled = self.ledger.cancel_conversation(conversation_id).await;
        if cancelled > 0 {
            tracing::info!(conversation_id, cancelled, "conversation tasks cancelled");
        }
        cancelled
    }

    /// 单个 Agent 的调用统计
    pub async fn metrics(&self, agent_name: &str) -> Option<AgentMetrics> {
        self.metrics.lock().await.get(agent_name).cloned()
    }

    /// 全部 Agent 的调用统计
    pub async fn all_metrics(&self) -> HashMap<String, AgentMetrics> {
        self.metrics.lock().await.clone()
    }

    /// 按 health_check_interval_ms 周期刷新注册表的健康标记，直到 shutdown
    pub fn spawn_health_monitor(&self) -> Option<JoinHandle<()>> {
        if self.config.health_check_interval_ms == 0 {
            return None;
        }
        let interval = Duration::from_millis(self.config.health_check_interval_ms);
        let registry = Arc::clone(&self.registry);
        let root = self.root.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = root.cancelled() => break,
                    _ = sleep(interval) => {
                        let unhealthy = registry.refresh_health().await;
                        tracing::debug!(unhealthy, "agent health refreshed");
                    }
                }
            }
        }))
    }

    /// 进行中的 Task 键
    pub async fn in_flight(&self) -> Vec<TaskKey> {
        self.ledger.keys().await
    }

    /// 最近的终态 Task（新 → 旧）
    pub async fn recent_tasks(&self, limit: usize) -> Vec<Task> {
        self.history.lock().await.iter().rev().take(limit).cloned().collect()
    }

    /// 关闭：取消所有进行中 Task（标记为 timed_out）并调用各 Agent 的 shutdown 钩子
    pub async fn shutdown(&self) {
        self.root.cancel();
        let cancelled = self.ledger.cancel_all().await;

        let grace = Instant::now() + Duration::from_millis(self.config.shutdown_grace_ms);
        while !self.ledger.is_empty().await && Instant::now() < grace {
            sleep(Duration::from_millis(10)).await;
        }
        let remaining = self.ledger.len().await;
        if remaining > 0 {
            tracing::warn!(remaining, "tasks still in flight after shutdown grace period");
        }

        for descriptor in self.registry.list(None).await {
            descriptor.handler.shutdown().await;
        }
        tracing::info!(cancelled, "agent manager shut down");
    }
}

fn settle<F>(task: &mut Task, transition: F)
where
    F: FnOnce(&mut Task) -> Result<(), crate::core::TaskTransitionError>,
{
    if let Err(e) = transition(task) {
        tracing::warn!(task_id = %task.id, error = %e, "illegal task transition ignored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::Agent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 可脚本化的测试 Agent
    struct ScriptedAgent {
        name: &'static str,
        priority: i32,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    enum Behavior {
        Reply(f64),
        Fail,
        Hang,
        Panic,
        Unavailable,
    }

    impl ScriptedAgent {
        fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name,
                priority: 0,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn with_priority(name: &'static str, priority: i32, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name,
                priority,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn name(&self) -> &str {
            self.name
        }

        fn capability_tags(&self) -> Vec<String> {
            vec![self.name.to_string()]
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn invoke(&self, _message: &Message, context: &AgentContext) -> Result<AgentReply, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Reply(confidence) => Ok(AgentReply::new(format!("from {}", self.name), confidence)),
                Behavior::Fail => Err(AgentError::Failed("upstream 500".to_string())),
                Behavior::Hang => {
                    context.cancel.cancelled().await;
                    Err(AgentError::Cancelled)
                }
                Behavior::Panic => panic!("agent bug"),
                Behavior::Unavailable => Err(AgentError::Unavailable("quota exhausted".to_string())),
            }
        }
    }

    async fn manager_with(agents: Vec<Arc<ScriptedAgent>>, timeout_ms: u64) -> AgentManager {
        let registry = Arc::new(AgentRegistry::new());
        for agent in agents {
            registry.register_agent(agent).await.unwrap();
        }
        AgentManager::new(
            registry,
            AgentManagerConfig {
                invocation_timeout_ms: timeout_ms,
                dispatch_budget_ms: timeout_ms * 4,
                ..Default::default()
            },
        )
    }

    fn request(candidates: &[&str], mode: DispatchMode) -> DispatchRequest {
        DispatchRequest::new(
            Message::user("c1", "hello"),
            candidates.iter().map(|s| s.to_string()).collect(),
            mode,
        )
    }

    #[tokio::test]
    async fn test_single_mode_invokes_only_top_candidate() {
        let top = ScriptedAgent::new("weather", Behavior::Reply(0.9));
        let runner_up = ScriptedAgent::new("search", Behavior::Reply(0.8));
        let manager = manager_with(vec![top.clone(), runner_up.clone()], 200).await;

        let outcome = manager
            .dispatch(request(&["weather", "search"], DispatchMode::Single))
            .await;
        assert_eq!(outcome.winner(), Some("weather"));
        assert_eq!(outcome.tasks().len(), 1);
        assert_eq!(top.calls.load(Ordering::SeqCst), 1);
        assert_eq!(runner_up.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_mode_falls_back_sequentially() {
        let failing = ScriptedAgent::new("weather", Behavior::Fail);
        let backup = ScriptedAgent::new("search", Behavior::Reply(0.4));
        let manager = manager_with(vec![failing, backup], 200).await;

        let outcome = manager
            .dispatch(request(&["weather", "search"], DispatchMode::Single))
            .await;
        assert_eq!(outcome.winner(), Some("search"));
        let statuses: Vec<_> = outcome.tasks().iter().map(|t| t.status).collect();
        assert_eq!(statuses, vec![TaskStatus::Failed, TaskStatus::Succeeded]);
    }

    #[tokio::test]
    async fn test_broadcast_isolates_hanging_and_panicking_agents() {
        let manager = manager_with(
            vec![
                ScriptedAgent::new("slow", Behavior::Hang),
                ScriptedAgent::new("buggy", Behavior::Panic),
                ScriptedAgent::new("good", Behavior::Reply(0.7)),
            ],
            50,
        )
        .await;

        let started = Instant::now();
        let outcome = manager
            .dispatch(request(&["slow", "buggy", "good"], DispatchMode::Broadcast))
            .await;
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(outcome.winner(), Some("good"));

        let by_agent: HashMap<_, _> = outcome
            .tasks()
            .iter()
            .map(|t| (t.assigned_agent.as_str(), t))
            .collect();
        assert_eq!(by_agent["slow"].status, TaskStatus::TimedOut);
        assert_eq!(by_agent["buggy"].status, TaskStatus::Failed);
        assert_eq!(
            by_agent["buggy"].error.as_ref().map(|e| e.kind),
            Some(TaskErrorKind::Panicked)
        );
        assert_eq!(by_agent["good"].status, TaskStatus::Succeeded);
        assert!(manager.in_flight().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_tie_break_by_priority_then_name() {
        let manager = manager_with(
            vec![
                ScriptedAgent::with_priority("zeta", 5, Behavior::Reply(0.8)),
                ScriptedAgent::with_priority("alpha", 1, Behavior::Reply(0.8)),
                ScriptedAgent::with_priority("beta", 5, Behavior::Reply(0.8)),
                ScriptedAgent::with_priority("low", 9, Behavior::Reply(0.3)),
            ],
            200,
        )
        .await;

        let outcome = manager
            .dispatch(request(&["zeta", "alpha", "beta", "low"], DispatchMode::Broadcast))
            .await;
        assert_eq!(outcome.winner(), Some("beta"));
    }

    #[tokio::test]
    async fn test_no_agent_available_is_a_value() {
        let registry = Arc::new(AgentRegistry::new());
        let manager = AgentManager::new(registry.clone(), AgentManagerConfig::default());
        registry
            .register_agent(ScriptedAgent::new("sick", Behavior::Reply(0.9)))
            .await
            .unwrap();
        registry.set_health("sick", false).await.unwrap();

        let outcome = manager
            .dispatch(request(&["sick", "ghost"], DispatchMode::Single))
            .await;
        match outcome {
            DispatchOutcome::NoAgentAvailable { attempts, skipped } => {
                assert!(attempts.is_empty());
                assert_eq!(skipped, vec!["sick".to_string(), "ghost".to_string()]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_conversation_marks_tasks_timed_out() {
        let manager = Arc::new(manager_with(vec![ScriptedAgent::new("slow", Behavior::Hang)], 5_000).await);

        let running = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.dispatch(request(&["slow"], DispatchMode::Single)).await })
        };
        while manager.in_flight().await.is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.cancel_conversation("c1").await, 1);

        let outcome = running.await.unwrap();
        assert_eq!(outcome.tasks()[0].status, TaskStatus::TimedOut);
        assert_eq!(
            outcome.tasks()[0].error.as_ref().map(|e| e.kind),
            Some(TaskErrorKind::Cancelled)
        );
        assert_eq!(manager.recent_tasks(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_nothing_running() {
        let manager = Arc::new(manager_with(vec![ScriptedAgent::new("slow", Behavior::Hang)], 5_000).await);
        let running = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.dispatch(request(&["slow"], DispatchMode::Broadcast)).await })
        };
        while manager.in_flight().await.is_empty() {
            sleep(Duration::from_millis(5)).await;
        }

        manager.shutdown().await;
        let outcome = running.await.unwrap();
        assert_eq!(outcome.tasks()[0].status, TaskStatus::TimedOut);
        assert!(manager.in_flight().await.is_empty());
        assert!(!manager.dispatch(request(&["slow"], DispatchMode::Single)).await.is_completed());
    }

    #[tokio::test]
    async fn test_metrics_track_requests_and_success_rate() {
        let manager = manager_with(
            vec![
                ScriptedAgent::new("good", Behavior::Reply(0.9)),
                ScriptedAgent::new("bad", Behavior::Fail),
            ],
            200,
        )
        .await;

        for _ in 0..2 {
            manager
                .dispatch(DispatchRequest::new(
                    Message::user("c1", "hello"),
                    vec!["bad".to_string(), "good".to_string()],
                    DispatchMode::Single,
                ))
                .await;
        }

        let good = manager.metrics("good").await.unwrap();
        assert_eq!(good.total_requests, 2);
        assert_eq!(good.success_rate(), 1.0);
        let bad = manager.metrics("bad").await.unwrap();
        assert_eq!(bad.total_requests, 2);
        assert_eq!(bad.successful_requests, 0);
        assert!(manager.metrics("ghost").await.is_none());
        assert_eq!(manager.all_metrics().await.len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_agent_is_marked_unhealthy_until_next_check() {
        let registry = Arc::new(AgentRegistry::new());
        registry
            .register_agent(ScriptedAgent::new("flaky", Behavior::Unavailable))
            .await
            .unwrap();
        let manager = AgentManager::new(
            Arc::clone(&registry),
            AgentManagerConfig {
                health_check_interval_ms: 30,
                ..Default::default()
            },
        );

        let outcome = manager.dispatch(request(&["flaky"], DispatchMode::Single)).await;
        assert!(!outcome.is_completed());
        assert!(!registry.is_available("flaky").await);

        let monitor = manager.spawn_health_monitor().unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !registry.is_available("flaky").await {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        manager.shutdown().await;
        monitor.await.unwrap();
    }

    #[tokio::test]
    async fn test_health_monitor_disabled_by_zero_interval() {
        let manager = AgentManager::new(
            Arc::new(AgentRegistry::new()),
            AgentManagerConfig {
                health_check_interval_ms: 0,
                ..Default::default()
            },
        );
        assert!(manager.spawn_health_monitor().is_none());
    }

    #[tokio::test]
    async fn test_conversation_tokens_released_after_dispatch() {
        let manager = manager_with(vec![ScriptedAgent::new("good", Behavior::Reply(0.9))], 200).await;
        for id in ["c1", "c2", "c3"] {
            manager
                .dispatch(DispatchRequest::new(
                    Message::user(id, "hello"),
                    vec!["good".to_string()],
                    DispatchMode::Single,
                ))
                .await;
        }
        assert_eq!(manager.tracked_conversations().await, 0);
    }
}
