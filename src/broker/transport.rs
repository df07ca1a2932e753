//! 传输层抽象
//!
//! Transport 负责把信封交给匹配的订阅者队列；外部实现（如 AMQP）可替换 LocalTransport。
//! LocalTransport 为每个订阅者维护有界队列：队列满视为瞬时失败（可重试），
//! 队列关闭的订阅者被静默移除。传输关闭后的投递返回 `TransportError::Closed`，不再重试。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use super::bus::Envelope;
use super::channel::ChannelPattern;
use crate::core::TransportError;

/// 订阅 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// 传输接口
#[async_trait]
pub trait Transport: Send + Sync {
    /// 投递到所有匹配订阅者，返回成功投递数（无订阅者时为 0）
    async fn deliver(&self, envelope: &Envelope) -> Result<usize, TransportError>;

    /// 挂接订阅者队列
    async fn attach(&self, pattern: ChannelPattern, sender: mpsc::Sender<Envelope>) -> SubscriptionId;

    /// 移除订阅者，返回是否存在
    async fn detach(&self, id: SubscriptionId) -> bool;

    /// 关闭传输，之后的投递返回 Closed
    async fn close(&self) {}
}

struct LocalSubscriber {
    id: SubscriptionId,
    pattern: ChannelPattern,
    sender: mpsc::Sender<Envelope>,
}

/// 进程内传输
#[derive(Default)]
pub struct LocalTransport {
    subscribers: RwLock<Vec<LocalSubscriber>>,
    closed: AtomicBool,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn deliver(&self, envelope: &Envelope) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed(format!("cannot deliver on '{}'", envelope.channel)));
        }
        let mut delivered = 0;
        let mut full = Vec::new();
        let mut closed = Vec::new();

        {
            let subscribers = self.subscribers.read().await;
            for sub in subscribers.iter().filter(|s| s.pattern.matches(&envelope.channel)) {
                match sub.sender.try_send(envelope.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => full.push(sub.id),
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(sub.id),
                }
            }
        }

        if !closed.is_empty() {
            self.subscribers
                .write()
                .await
                .retain(|s| !closed.contains(&s.id));
            tracing::debug!(count = closed.len(), "pruned closed subscribers");
        }

        if !full.is_empty() {
            // 重试时已成功的订阅者会再收到一次，符合至少一次语义
            return Err(TransportError::Transient(format!(
                "{} subscriber queue(s) full on '{}'",
                full.len(),
                envelope.channel
            )));
        }

        Ok(delivered)
    }

    async fn attach(&self, pattern: ChannelPattern, sender: mpsc::Sender<Envelope>) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.subscribers.write().await.push(LocalSubscriber { id, pattern, sender });
        id
    }

    async fn detach(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let dropped = {
            let mut subscribers = self.subscribers.write().await;
            let count = subscribers.len();
            subscribers.clear();
            count
        };
        tracing::debug!(dropped, "local transport closed");
    }
}
