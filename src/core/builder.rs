//! Switchboard 构建器：按 AppConfig 组装总线、记忆、注册表、AgentManager、分类器与调度器
//!
//! 命令行入口与集成测试共享同一套装配逻辑。

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::agents::{Agent, AgentDescriptor, AgentManager, AgentRegistry, FallbackAgent};
use crate::broker::{MessageBroker, Transport};
use crate::config::AppConfig;
use crate::core::{BrokerError, RegistryError};
use crate::dispatcher::{
    ClassifierKind, DispatchListener, Dispatcher, HybridClassifier, Incoming, IntentClassifier,
    KeywordClassifier, ListenerHandle, LlmClassifier,
};
use crate::llm::LlmClient;
use crate::memory::{create_conversation_store, ConversationStore, MemoryManager, Message, Summarizer};

/// 装配完成的编排核心
pub struct Switchboard {
    config: AppConfig,
    broker: Arc<MessageBroker>,
    memory: Arc<MemoryManager>,
    registry: Arc<AgentRegistry>,
    manager: Arc<AgentManager>,
    dispatcher: Arc<Dispatcher>,
    listener: DispatchListener,
    listener_handle: Mutex<Option<ListenerHandle>>,
    health_monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Switchboard {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<AgentManager> {
        &self.manager
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// 直接调度一条入站内容（不经过总线的入站频道）
    pub async fn handle(&self, incoming: Incoming) -> Message {
        self.dispatcher.handle(incoming).await
    }

    /// 开始监听 `conversation.*.inbound`；重复调用无副作用
    pub async fn start_listener(&self) -> Result<(), BrokerError> {
        let mut handle = self.listener_handle.lock().await;
        if handle.is_none() {
            *handle = Some(self.listener.start().await?);
        }
        Ok(())
    }

    pub async fn stop_listener(&self) {
        if let Some(handle) = self.listener_handle.lock().await.take() {
            self.listener.stop(handle).await;
        }
    }

    pub async fn is_listening(&self) -> bool {
        self.listener_handle.lock().await.is_some()
    }

    /// 停止监听，关闭 AgentManager，最后关闭总线
    pub async fn shutdown(&self) {
        self.stop_listener().await;
        self.manager.shutdown().await;
        if let Some(monitor) = self.health_monitor.lock().await.take() {
            if let Err(e) = monitor.await {
                tracing::warn!(error = %e, "health monitor ended abnormally");
            }
        }
        self.broker.close().await;
    }
}

/// Switchboard 构建器
pub struct SwitchboardBuilder {
    config: AppConfig,
    store: Option<Arc<dyn ConversationStore>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    transport: Option<Arc<dyn Transport>>,
    classifier: Option<Arc<dyn IntentClassifier>>,
    llm: Option<Arc<dyn LlmClient>>,
    keywords: KeywordClassifier,
    agents: Vec<Arc<dyn Agent>>,
}

impl SwitchboardBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            summarizer: None,
            transport: None,
            classifier: None,
            llm: None,
            keywords: KeywordClassifier::new(),
            agents: Vec::new(),
        }
    }

    /// 指定存储；未指定时按 memory.db_path 创建
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 指定分类器，覆盖 dispatcher.classifier 配置
    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// llm / hybrid 分类器使用的 LLM
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 为关键词分类器追加某个 Agent 的关键词
    pub fn with_keywords<I, S>(mut self, agent: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = self.keywords.with_keywords(agent, keywords);
        self
    }

    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    fn build_classifier(&mut self) -> Arc<dyn IntentClassifier> {
        if let Some(classifier) = self.classifier.take() {
            return classifier;
        }
        let keywords = std::mem::take(&mut self.keywords);
        match (self.config.dispatcher.classifier, self.llm.take()) {
            (ClassifierKind::Keyword, _) => Arc::new(keywords),
            (ClassifierKind::Llm, Some(llm)) => Arc::new(LlmClassifier::new(llm)),
            (ClassifierKind::Hybrid, Some(llm)) => Arc::new(HybridClassifier::new(keywords, LlmClassifier::new(llm))),
            (kind, None) => {
                tracing::warn!(?kind, "classifier requires an LLM client but none was provided, using keyword classifier");
                Arc::new(keywords)
            }
        }
    }

    /// 组装各组件并注册 Agent
    ///
    /// 未提供与 dispatcher.fallback_agent 同名的 Agent 时自动注册内置 FallbackAgent；
    /// 无论哪种情况，兜底 Agent 的优先级都固定为最低。
    /// Agent 重名时返回 DuplicateAgent。
    pub async fn build(mut self) -> Result<Switchboard, RegistryError> {
        let classifier = self.build_classifier();
        let config = self.config;

        let broker = Arc::new(match self.transport {
            Some(transport) => MessageBroker::with_transport(config.broker.clone(), transport),
            None => MessageBroker::new(config.broker.clone()),
        });

        let store = match self.store {
            Some(store) => store,
            None => create_conversation_store(config.db_path().as_deref()).await,
        };
        let mut memory = MemoryManager::new(store, config.memory.clone());
        if let Some(summarizer) = self.summarizer {
            memory = memory.with_summarizer(summarizer);
        }
        let memory = Arc::new(memory);

        let fallback_name = config.dispatcher.fallback_agent.clone();
        let registry = Arc::new(AgentRegistry::new().with_reserved(&fallback_name));
        if !self.agents.iter().any(|a| a.name() == fallback_name) {
            registry
                .register_agent(Arc::new(FallbackAgent::new(&fallback_name)))
                .await?;
        }
        for agent in self.agents {
            let descriptor = AgentDescriptor::from_agent(agent);
            if descriptor.name == fallback_name {
                registry.register(descriptor.with_priority(i32::MIN)).await?;
            } else {
                registry.register(descriptor).await?;
            }
        }

        let manager = Arc::new(
            AgentManager::new(Arc::clone(&registry), config.agents.clone()).with_broker(Arc::clone(&broker)),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&memory),
            Arc::clone(&manager),
            classifier,
            Arc::clone(&broker),
            config.dispatcher.clone(),
        ));
        let listener = DispatchListener::new(Arc::clone(&dispatcher), Arc::clone(&broker))
            .with_idle_timeout(config.dispatcher.mailbox_idle());
        let health_monitor = manager.spawn_health_monitor();

        tracing::info!(
            app = %config.app.name,
            agents = registry.len().await,
            classifier = ?config.dispatcher.classifier,
            "switchboard assembled"
        );

        Ok(Switchboard {
            config,
            broker,
            memory,
            registry,
            manager,
            dispatcher,
            listener,
            listener_handle: Mutex::new(None),
            health_monitor: Mutex::new(health_monitor),
        })
    }
}
