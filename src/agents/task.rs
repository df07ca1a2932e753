//! Task：单次 Agent 调用的记录与状态机
//!
//! 状态机：`pending → running → {succeeded | failed | timed_out}`，终态不可离开。
//! TaskLedger 保证同一 `(conversation_id, originating_message_id, agent)` 三元组
//! 任意时刻至多一个非终态 Task。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::traits::AgentReply;
use crate::core::TaskTransitionError;

pub type TaskId = String;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 已创建，尚未开始
    Pending,
    /// 正在调用 Agent
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::TimedOut)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Succeeded)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::TimedOut)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed_out",
        }
    }
}

/// Task 失败原因分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Agent 返回领域错误
    AgentInvocation,
    /// Agent 调用 panic
    Panicked,
    /// 超过单次调用超时或调度预算
    Timeout,
    /// 会话取消或进程关闭
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// 去重键：同一输入、同一 Agent 只允许一个进行中的 Task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub conversation_id: String,
    pub originating_message_id: String,
    pub agent_name: String,
}

impl TaskKey {
    pub fn new(
        conversation_id: impl Into<String>,
        originating_message_id: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            originating_message_id: originating_message_id.into(),
            agent_name: agent_name.into(),
        }
    }
}

/// 单次 Agent 调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub conversation_id: String,
    pub originating_message_id: String,
    pub assigned_agent: String,
    pub status: TaskStatus,
    pub result: Option<AgentReply>,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(key: &TaskKey) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            conversation_id: key.conversation_id.clone(),
            originating_message_id: key.originating_message_id.clone(),
            assigned_agent: key.agent_name.clone(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(
            &self.conversation_id,
            &self.originating_message_id,
            &self.assigned_agent,
        )
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), TaskTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskTransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        match next {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), TaskTransitionError> {
        self.transition(TaskStatus::Running)
    }

    pub fn succeed(&mut self, reply: AgentReply) -> Result<(), TaskTransitionError> {
        self.transition(TaskStatus::Succeeded)?;
        self.result = Some(reply);
        Ok(())
    }

    pub fn fail(&mut self, error: TaskError) -> Result<(), TaskTransitionError> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn time_out(&mut self, error: TaskError) -> Result<(), TaskTransitionError> {
        self.transition(TaskStatus::TimedOut)?;
        self.error = Some(error);
        Ok(())
    }

    /// 成功时的置信度
    pub fn confidence(&self) -> Option<f64> {
        self.result.as_ref().map(|r| r.confidence)
    }

    /// 运行耗时（毫秒）；未结束返回 None
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

struct InFlight {
    task_id: TaskId,
    cancel: CancellationToken,
}

/// 进行中 Task 的登记表
#[derive(Default)]
pub struct TaskLedger {
    in_flight: Mutex<HashMap<TaskKey, InFlight>>,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记新 Task；同键已有非终态 Task 时返回 None
    pub async fn begin(&self, key: &TaskKey, cancel: CancellationToken) -> Option<Task> {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.contains_key(key) {
            return None;
        }
        let task = Task::new(key);
        in_flight.insert(
            key.clone(),
            InFlight {
                task_id: task.id.clone(),
                cancel,
            },
        );
        Some(task)
    }

    /// Task 进入终态后移除登记
    pub async fn finish(&self, task: &Task) {
        let mut in_flight = self.in_flight.lock().await;
        let key = task.key();
        if in_flight.get(&key).map(|f| f.task_id == task.id).unwrap_or(false) {
            in_flight.remove(&key);
        }
    }

    /// 取消某会话的所有进行中 Task，返回取消数量
    pub async fn cancel_conversation(&self, conversation_id: &str) -> usize {
        let in_flight = self.in_flight.lock().await;
        let mut count = 0;
        for (key, flight) in in_flight.iter() {
            if key.conversation_id == conversation_id {
                flight.cancel.cancel();
                count += 1;
            }
        }
        count
    }

    /// 会话是否还有进行中的 Task
    pub async fn has_conversation(&self, conversation_id: &str) -> bool {
        self.in_flight
            .lock()
            .await
            .keys()
            .any(|key| key.conversation_id == conversation_id)
    }

    pub async fn cancel_all(&self) -> usize {
        let in_flight = self.in_flight.lock().await;
        for flight in in_flight.values() {
            flight.cancel.cancel();
        }
        in_flight.len()
    }

    pub async fn keys(&self) -> Vec<TaskKey> {
        self.in_flight.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.in_flight.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TaskKey {
        TaskKey::new("c1", "m1", "weather")
    }

    #[test]
    fn test_state_machine_happy_path() {
        let mut task = Task::new(&key());
        assert_eq!(task.status, TaskStatus::Pending);
        task.start().unwrap();
        assert!(task.started_at.is_some());
        task.succeed(AgentReply::new("sunny", 0.9)).unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(task.finished_at.is_some());
        assert_eq!(task.confidence(), Some(0.9));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut task = Task::new(&key());
        task.start().unwrap();
        task.time_out(TaskError::new(TaskErrorKind::Timeout, "slow")).unwrap();

        let err = task.succeed(AgentReply::new("late", 1.0)).unwrap_err();
        assert_eq!(err.from, TaskStatus::TimedOut);
        assert_eq!(err.to, TaskStatus::Succeeded);
        assert!(task.result.is_none());
        assert!(task.start().is_err());
    }

    #[test]
    fn test_pending_cannot_finish_directly() {
        let mut task = Task::new(&key());
        assert!(task
            .fail(TaskError::new(TaskErrorKind::AgentInvocation, "boom"))
            .is_err());
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_ledger_rejects_duplicate_in_flight() {
        let ledger = TaskLedger::new();
        let first = ledger.begin(&key(), CancellationToken::new()).await.unwrap();
        assert!(ledger.begin(&key(), CancellationToken::new()).await.is_none());

        ledger.finish(&first).await;
        assert!(ledger.is_empty().await);
        assert!(ledger.begin(&key(), CancellationToken::new()).await.is_some());
    }

    #[tokio::test]
    async fn test_ledger_cancel_conversation() {
        let ledger = TaskLedger::new();
        let token = CancellationToken::new();
        ledger.begin(&key(), token.clone()).await.unwrap();
        ledger
            .begin(&TaskKey::new("c2", "m1", "weather"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ledger.cancel_conversation("c1").await, 1);
        assert!(token.is_cancelled());
        assert_eq!(ledger.len().await, 2);
    }
}
