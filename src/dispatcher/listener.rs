//! 入站监听：订阅 `conversation.*.inbound`，每个会话一个顺序邮箱
//!
//! 不同会话并发处理，同一会话按到达顺序逐条调度。
//! 重复投递先由消息 ID 去重，漏网的再由 Dispatcher 的已存回复查找兜底。
//! 邮箱空闲超过 idle 时回收，下一条消息到达时重新创建。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::dispatch::Dispatcher;
use crate::broker::{channel, handler_fn, Envelope, MessageBroker, MessageDeduplicator, SubscriptionHandle};
use crate::core::BrokerError;
use crate::memory::Message;

/// 每个会话邮箱的容量
const MAILBOX_CAPACITY: usize = 64;
const DEFAULT_MAILBOX_IDLE: Duration = Duration::from_secs(60);

struct Mailboxes {
    senders: Mutex<HashMap<String, mpsc::Sender<Message>>>,
    dedup: Mutex<MessageDeduplicator>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    idle: Duration,
}

impl Mailboxes {
    fn spawn_worker(self: &Arc<Self>, conversation_id: &str) -> mpsc::Sender<Message> {
        let (tx, mut rx) = mpsc::channel::<Message>(MAILBOX_CAPACITY);
        let mailboxes = Arc::clone(self);
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            tracing::debug!(conversation_id = %conversation_id, "mailbox worker started");
            loop {
                let message = tokio::select! {
                    _ = mailboxes.cancel.cancelled() => break,
                    next = tokio::time::timeout(mailboxes.idle, rx.recv()) => match next {
                        Ok(Some(message)) => message,
                        Ok(None) => break,
                        Err(_) => {
                            mailboxes.retire(&conversation_id, &mut rx).await;
                            break;
                        }
                    },
                };
                mailboxes.dispatcher.handle_message(message).await;
            }
            // 关闭前已入队的消息照常处理
            while let Ok(message) = rx.try_recv() {
                if mailboxes.cancel.is_cancelled() {
                    break;
                }
                mailboxes.dispatcher.handle_message(message).await;
            }
            tracing::debug!(conversation_id = %conversation_id, "mailbox worker stopped");
        });
        tx
    }

    /// 关闭空闲邮箱并从映射中移除
    async fn retire(&self, conversation_id: &str, rx: &mut mpsc::Receiver<Message>) {
        let mut senders = self.senders.lock().await;
        rx.close();
        if senders.get(conversation_id).is_some_and(|s| s.is_closed()) {
            senders.remove(conversation_id);
        }
    }

    async fn sender_for(self: &Arc<Self>, conversation_id: &str) -> mpsc::Sender<Message> {
        let mut senders = self.senders.lock().await;
        match senders.get(conversation_id) {
            Some(sender) if !sender.is_closed() => sender.clone(),
            _ => {
                let sender = self.spawn_worker(conversation_id);
                senders.insert(conversation_id.to_string(), sender.clone());
                sender
            }
        }
    }

    async fn route(self: &Arc<Self>, message: Message) -> anyhow::Result<()> {
        if !self.dedup.lock().await.first_seen(&message.id) {
            tracing::debug!(message_id = %message.id, "duplicate inbound delivery dropped");
            return Ok(());
        }

        // 邮箱可能恰好在取到发送端之后被回收，此时换一个新邮箱再投一次
        let mut message = message;
        for _ in 0..2 {
            let sender = self.sender_for(&message.conversation_id).await;
            match sender.send(message).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => message = returned,
            }
        }

        // 允许重投再次进入
        self.dedup.lock().await.forget(&message.id);
        anyhow::bail!("mailbox for conversation '{}' closed", message.conversation_id)
    }
}

/// 入站监听器
pub struct DispatchListener {
    broker: Arc<MessageBroker>,
    mailboxes: Arc<Mailboxes>,
}

/// 运行中的监听器句柄
pub struct ListenerHandle {
    subscription: SubscriptionHandle,
    cancel: CancellationToken,
}

impl DispatchListener {
    pub fn new(dispatcher: Arc<Dispatcher>, broker: Arc<MessageBroker>) -> Self {
        Self {
            broker,
            mailboxes: Arc::new(Mailboxes {
                senders: Mutex::new(HashMap::new()),
                dedup: Mutex::new(MessageDeduplicator::default()),
                dispatcher,
                cancel: CancellationToken::new(),
                idle: DEFAULT_MAILBOX_IDLE,
            }),
        }
    }

    /// 邮箱空闲回收时间；须在 start 之前设置
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        if let Some(mailboxes) = Arc::get_mut(&mut self.mailboxes) {
            mailboxes.idle = idle;
        }
        self
    }

    /// 开始订阅所有会话的入站频道
    pub async fn start(&self) -> Result<ListenerHandle, BrokerError> {
        let mailboxes = Arc::clone(&self.mailboxes);
        let subscription = self
            .broker
            .subscribe(
                channel::ALL_INBOUND,
                handler_fn(move |envelope: Envelope| {
                    let mailboxes = Arc::clone(&mailboxes);
                    async move {
                        let message: Message = match envelope.decode() {
                            Ok(message) => message,
                            Err(e) => {
                                // 无法解析的载荷重投也无济于事
                                tracing::error!(channel = %envelope.channel, error = %e, "undecodable inbound payload dropped");
                                return Ok(());
                            }
                        };
                        if channel::conversation_of(&envelope.channel).as_deref() != Some(message.conversation_id.as_str()) {
                            tracing::warn!(
                                channel = %envelope.channel,
                                conversation_id = %message.conversation_id,
                                "inbound message published on another conversation's channel, dropped"
                            );
                            return Ok(());
                        }
                        mailboxes.route(message).await
                    }
                }),
            )
            .await?;

        tracing::info!(pattern = channel::ALL_INBOUND, "dispatch listener started");
        Ok(ListenerHandle {
            subscription,
            cancel: self.mailboxes.cancel.clone(),
        })
    }

    /// 当前的会话邮箱数
    pub async fn mailbox_count(&self) -> usize {
        self.mailboxes.senders.lock().await.len()
    }

    /// 停止订阅并结束所有邮箱 worker
    pub async fn stop(&self, handle: ListenerHandle) {
        self.broker.unsubscribe(handle.subscription).await;
        handle.cancel.cancel();
        self.mailboxes.senders.lock().await.clear();
        tracing::info!("dispatch listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentManager, AgentManagerConfig, AgentRegistry, EchoAgent, FallbackAgent};
    use crate::broker::BrokerConfig;
    use crate::dispatcher::{DispatcherConfig, KeywordClassifier};
    use crate::memory::MemoryManager;

    async fn setup() -> (Arc<MessageBroker>, Arc<Dispatcher>) {
        let broker = Arc::new(MessageBroker::new(BrokerConfig::default()));
        let registry = Arc::new(AgentRegistry::new().with_reserved("fallback"));
        registry.register_agent(Arc::new(FallbackAgent::default())).await.unwrap();
        registry.register_agent(Arc::new(EchoAgent)).await.unwrap();
        let manager = Arc::new(AgentManager::new(registry, AgentManagerConfig::default()));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(MemoryManager::in_memory()),
            manager,
            Arc::new(KeywordClassifier::new()),
            Arc::clone(&broker),
            DispatcherConfig::default(),
        ));
        (broker, dispatcher)
    }

    #[tokio::test]
    async fn test_listener_routes_inbound_to_response_channel() {
        let (broker, dispatcher) = setup().await;
        let listener = DispatchListener::new(Arc::clone(&dispatcher), Arc::clone(&broker));
        let handle = listener.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _responses = broker
            .subscribe(
                channel::ALL_RESPONSES,
                handler_fn(move |envelope: Envelope| {
                    let tx = tx.clone();
                    async move {
                        tx.send(envelope.decode::<Message>()?)?;
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        for conversation in ["c1", "c2"] {
            let inbound = Message::user(conversation, format!("echo hi {conversation}"));
            broker.publish_message(&channel::inbound(conversation), &inbound).await.unwrap();
        }

        let mut replies = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        replies.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        assert_eq!(replies[0].content, "hi c1");
        assert_eq!(replies[1].content, "hi c2");
        assert_eq!(listener.mailbox_count().await, 2);

        listener.stop(handle).await;
        assert_eq!(listener.mailbox_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_dispatched_once() {
        let (broker, dispatcher) = setup().await;
        let listener = DispatchListener::new(Arc::clone(&dispatcher), Arc::clone(&broker));
        let _handle = listener.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _responses = broker
            .subscribe(
                &channel::response("c1"),
                handler_fn(move |envelope: Envelope| {
                    let tx = tx.clone();
                    async move {
                        tx.send(envelope.sequence)?;
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        let inbound = Message::user("c1", "echo twice?");
        broker.publish_message(&channel::inbound("c1"), &inbound).await.unwrap();
        broker.publish_message(&channel::inbound("c1"), &inbound).await.unwrap();
        let follow_up = Message::user("c1", "echo done");
        broker.publish_message(&channel::inbound("c1"), &follow_up).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), 2);
        let history = dispatcher.memory().history("c1").await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].id, inbound.id);
        assert_eq!(history[2].id, follow_up.id);
    }

    #[tokio::test]
    async fn test_idle_mailboxes_are_reclaimed_and_recreated() {
        let (broker, dispatcher) = setup().await;
        let listener = DispatchListener::new(Arc::clone(&dispatcher), Arc::clone(&broker))
            .with_idle_timeout(Duration::from_millis(50));
        let handle = listener.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _responses = broker
            .subscribe(
                &channel::response("c1"),
                handler_fn(move |envelope: Envelope| {
                    let tx = tx.clone();
                    async move {
                        tx.send(envelope.decode::<Message>()?)?;
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        let first = Message::user("c1", "echo one");
        broker.publish_message(&channel::inbound("c1"), &first).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().content, "one");

        tokio::time::timeout(Duration::from_secs(2), async {
            while listener.mailbox_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let second = Message::user("c1", "echo two");
        broker.publish_message(&channel::inbound("c1"), &second).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().content, "two");
        assert_eq!(dispatcher.memory().history("c1").await.unwrap().len(), 4);

        listener.stop(handle).await;
    }

    #[tokio::test]
    async fn test_dotted_conversation_id_reaches_dispatcher() {
        let (broker, dispatcher) = setup().await;
        let listener = DispatchListener::new(Arc::clone(&dispatcher), Arc::clone(&broker));
        let handle = listener.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _responses = broker
            .subscribe(
                &channel::response("user.42"),
                handler_fn(move |envelope: Envelope| {
                    let tx = tx.clone();
                    async move {
                        tx.send(envelope.decode::<Message>()?)?;
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        let inbound = Message::user("user.42", "echo dotted id");
        let ack = broker
            .publish_message(&channel::inbound("user.42"), &inbound)
            .await
            .unwrap();
        assert_eq!(ack.delivered, 1);

        let reply = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.conversation_id, "user.42");
        assert_eq!(reply.content, "dotted id");

        listener.stop(handle).await;
    }
}
