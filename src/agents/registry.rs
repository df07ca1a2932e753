//! Agent 注册表
//!
//! 名称 → AgentDescriptor 的可变映射，启动时或插件加载阶段显式 register；
//! 单写多读（RwLock），注册冲突返回 DuplicateAgent 且不改变状态。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use super::traits::Agent;
use crate::core::RegistryError;

/// Agent 描述：注册后除健康标记外不可变
#[derive(Clone)]
pub struct AgentDescriptor {
    pub name: String,
    pub capability_tags: BTreeSet<String>,
    pub priority: i32,
    pub healthy: bool,
    pub handler: Arc<dyn Agent>,
}

impl AgentDescriptor {
    /// 从 Agent 实现读取名称、标签与优先级
    pub fn from_agent(agent: Arc<dyn Agent>) -> Self {
        Self {
            name: agent.name().to_string(),
            capability_tags: agent.capability_tags().into_iter().collect(),
            priority: agent.priority(),
            healthy: true,
            handler: agent,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.capability_tags.contains(tag)
    }
}

impl std::fmt::Debug for AgentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDescriptor")
            .field("name", &self.name)
            .field("capability_tags", &self.capability_tags)
            .field("priority", &self.priority)
            .field("healthy", &self.healthy)
            .finish()
    }
}

/// 注册表
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentDescriptor>>,
    /// 不可注销的保留名（fallback agent）
    reserved: Option<String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 声明保留名：该 Agent 一旦注册便不可注销
    pub fn with_reserved(mut self, name: impl Into<String>) -> Self {
        self.reserved = Some(name.into());
        self
    }

    pub fn reserved(&self) -> Option<&str> {
        self.reserved.as_deref()
    }

    pub async fn register(&self, descriptor: AgentDescriptor) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateAgent(descriptor.name));
        }
        tracing::info!(agent = %descriptor.name, priority = descriptor.priority, "agent registered");
        agents.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// 便捷方法：直接注册 Agent 实现
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<(), RegistryError> {
        self.register(AgentDescriptor::from_agent(agent)).await
    }

    pub async fn deregister(&self, name: &str) -> Result<AgentDescriptor, RegistryError> {
        if self.reserved.as_deref() == Some(name) {
            return Err(RegistryError::ReservedAgent(name.to_string()));
        }
        let removed = self
            .agents
            .write()
            .await
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownAgent(name.to_string()))?;
        tracing::info!(agent = %name, "agent deregistered");
        Ok(removed)
    }

    pub async fn get(&self, name: &str) -> Option<AgentDescriptor> {
        self.agents.read().await.get(name).cloned()
    }

    /// 已注册且健康
    pub async fn is_available(&self, name: &str) -> bool {
        self.agents
            .read()
            .await
            .get(name)
            .map(|d| d.healthy)
            .unwrap_or(false)
    }

    pub async fn set_health(&self, name: &str, healthy: bool) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().await;
        let descriptor = agents
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownAgent(name.to_string()))?;
        if descriptor.healthy != healthy {
            tracing::info!(agent = %name, healthy, "agent health changed");
        }
        descriptor.healthy = healthy;
        Ok(())
    }

    /// 轮询所有 Agent 的 health_check 并更新标记，返回不健康数量
    pub async fn refresh_health(&self) -> usize {
        let snapshot: Vec<(String, Arc<dyn Agent>)> = self
            .agents
            .read()
            .await
            .values()
            .map(|d| (d.name.clone(), Arc::clone(&d.handler)))
            .collect();

        let mut unhealthy = 0;
        for (name, agent) in snapshot {
            let healthy = agent.health_check().await;
            if !healthy {
                unhealthy += 1;
            }
            // 轮询期间被注销的 Agent 直接跳过
            let _ = self.set_health(&name, healthy).await;
        }
        unhealthy
    }

    /// 按标签过滤；按 priority 降序、name 升序排列
    pub async fn list(&self, capability_tag: Option<&str>) -> Vec<AgentDescriptor> {
        let agents = self.agents.read().await;
        let mut list: Vec<AgentDescriptor> = agents
            .values()
            .filter(|d| capability_tag.map(|t| d.has_tag(t)).unwrap_or(true))
            .cloned()
            .collect();
        sort_descriptors(&mut list);
        list
    }

    pub async fn names(&self) -> Vec<String> {
        self.list(None).await.into_iter().map(|d| d.name).collect()
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}

pub(crate) fn sort_descriptors(list: &mut [AgentDescriptor]) {
    list.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
}
