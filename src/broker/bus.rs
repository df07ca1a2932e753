//! 消息总线：publish / subscribe / unsubscribe
//!
//! - 每次 publish 在该频道上递增单调序号（用于消费端发现丢失）
//! - 同一频道的发布串行化，保证对单个订阅者的投递顺序与发布顺序一致
//! - 瞬时传输失败（含单次投递超时）按退避策略重试，耗尽后返回 BrokerUnavailable
//! - 每个订阅由一个 worker 顺序调用 handler；handler 出错时重投，超过上限后记录并丢弃

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::channel::ChannelPattern;
use super::consumer::{SequenceCheck, SequenceTracker};
use super::retry::BackoffPolicy;
use super::transport::{LocalTransport, SubscriptionId, Transport};
use crate::core::{BrokerError, TransportError};
use crate::memory::Message;

/// [broker] 段
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// 发布总尝试次数（含首次）
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: u32,
    pub max_delay_ms: u64,
    /// 每个订阅者的队列容量
    pub subscriber_queue: usize,
    /// handler 失败后的最大重投次数
    pub max_redeliveries: u32,
    /// 单次投递的超时，超时按瞬时失败重试
    pub delivery_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            backoff_factor: 2,
            max_delay_ms: 2000,
            subscriber_queue: 256,
            max_redeliveries: 3,
            delivery_timeout_ms: 1_000,
        }
    }
}

impl BrokerConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            self.backoff_factor,
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    fn redelivery(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_redeliveries.saturating_add(1),
            ..self.backoff()
        }
    }
}

/// 总线上传输的信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    /// 频道内单调递增序号，从 1 开始
    pub sequence: u64,
    /// 载荷为 Message 时的消息 ID，供消费端去重
    pub message_id: Option<String>,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| BrokerError::Serialization(e.to_string()))
    }
}

/// 发布确认
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    pub channel: String,
    pub sequence: u64,
    /// 投递到的订阅者数量
    pub delivered: usize,
    pub attempts: u32,
}

/// 订阅处理器；必须幂等（至少一次投递）
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

/// 闭包适配器
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        (self.0)(envelope.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// 订阅句柄，传给 unsubscribe 以取消
pub struct SubscriptionHandle {
    id: SubscriptionId,
    pattern: String,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// 消息总线
pub struct MessageBroker {
    transport: Arc<dyn Transport>,
    /// 频道 → 序号（每个频道一把锁，发布在锁内完成以保序）
    sequences: Mutex<HashMap<String, Arc<Mutex<u64>>>>,
    config: BrokerConfig,
}

impl MessageBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_transport(config, Arc::new(LocalTransport::new()))
    }

    pub fn with_transport(config: BrokerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            sequences: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    async fn channel_slot(&self, channel: &str) -> Arc<Mutex<u64>> {
        let mut sequences = self.sequences.lock().await;
        Arc::clone(sequences.entry(channel.to_string()).or_default())
    }

    /// 发布任意 JSON 载荷
    pub async fn publish(&self, channel: &str, payload: Value) -> Result<DeliveryAck, BrokerError> {
        self.publish_inner(channel, payload, None).await
    }

    /// 发布可序列化载荷
    pub async fn publish_json<T: Serialize>(&self, channel: &str, payload: &T) -> Result<DeliveryAck, BrokerError> {
        let value = serde_json::to_value(payload).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        self.publish_inner(channel, value, None).await
    }

    /// 发布对话消息，信封携带 message_id 供消费端去重
    pub async fn publish_message(&self, channel: &str, message: &Message) -> Result<DeliveryAck, BrokerError> {
        let value = serde_json::to_value(message).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        self.publish_inner(channel, value, Some(message.id.clone())).await
    }

    async fn publish_inner(
        &self,
        channel: &str,
        payload: Value,
        message_id: Option<String>,
    ) -> Result<DeliveryAck, BrokerError> {
        if !ChannelPattern::parse(channel)?.is_concrete() {
            return Err(BrokerError::InvalidPattern(format!(
                "cannot publish to wildcard channel '{channel}'"
            )));
        }

        let slot = self.channel_slot(channel).await;
        let mut last = slot.lock().await;
        // 无论投递成败都递增，失败留下的缺口由消费端发现
        *last += 1;
        let envelope = Envelope {
            channel: channel.to_string(),
            sequence: *last,
            message_id,
            payload,
            published_at: Utc::now(),
        };

        let transport = Arc::clone(&self.transport);
        let delivery_timeout = self.config.delivery_timeout();
        let result = self
            .config
            .backoff()
            .retry(
                |attempt| {
                    let transport = Arc::clone(&transport);
                    let envelope = &envelope;
                    async move {
                        let r = match tokio::time::timeout(delivery_timeout, transport.deliver(envelope)).await {
                            Ok(r) => r,
                            Err(_) => Err(TransportError::Transient(format!(
                                "delivery timed out after {}ms",
                                delivery_timeout.as_millis()
                            ))),
                        };
                        if let Err(e) = &r {
                            tracing::debug!(channel = %envelope.channel, attempt, error = %e, "publish attempt failed");
                        }
                        r
                    }
                },
                |e| matches!(e, TransportError::Transient(_)),
            )
            .await;

        match result {
            Ok((delivered, attempts)) => Ok(DeliveryAck {
                channel: envelope.channel,
                sequence: envelope.sequence,
                delivered,
                attempts,
            }),
            Err(exhausted) => {
                tracing::warn!(
                    channel = %channel,
                    sequence = envelope.sequence,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "broker unavailable"
                );
                Err(BrokerError::BrokerUnavailable {
                    channel: channel.to_string(),
                    attempts: exhausted.attempts,
                    reason: exhausted.last_error.to_string(),
                })
            }
        }
    }

    /// 关闭底层传输；之后的发布立即返回 BrokerUnavailable
    pub async fn close(&self) {
        self.transport.close().await;
        tracing::info!("message broker closed");
    }

    /// 当前频道已分配的最大序号
    pub async fn last_sequence(&self, channel: &str) -> u64 {
        let slot = self.sequences.lock().await.get(channel).cloned();
        match slot {
            Some(slot) => *slot.lock().await,
            None => 0,
        }
    }

    /// 订阅频道或主题模式
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BrokerError> {
        let parsed = ChannelPattern::parse(pattern)?;
        let (tx, rx) = mpsc::channel(self.config.subscriber_queue.max(1));
        let id = self.transport.attach(parsed, tx).await;
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_subscription(
            id,
            rx,
            handler,
            self.config.redelivery(),
            cancel.clone(),
        ));

        tracing::debug!(subscription = %id, pattern, "subscribed");
        Ok(SubscriptionHandle {
            id,
            pattern: pattern.to_string(),
            cancel,
            worker,
        })
    }

    /// 取消订阅：从传输层摘除并停止 worker
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let existed = self.transport.detach(handle.id).await;
        handle.cancel.cancel();
        if let Err(e) = handle.worker.await {
            tracing::warn!(subscription = %handle.id, error = %e, "subscription worker ended abnormally");
        }
        tracing::debug!(subscription = %handle.id, pattern = %handle.pattern, "unsubscribed");
        existed
    }
}

impl Default for MessageBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

async fn run_subscription(
    id: SubscriptionId,
    mut rx: mpsc::Receiver<Envelope>,
    handler: Arc<dyn MessageHandler>,
    redelivery: BackoffPolicy,
    cancel: CancellationToken,
) {
    let mut tracker = SequenceTracker::new();
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        match tracker.observe(&envelope.channel, envelope.sequence) {
            SequenceCheck::InOrder => {}
            SequenceCheck::Gap { missing } => {
                tracing::warn!(subscription = %id, channel = %envelope.channel, missing, "sequence gap detected");
            }
            SequenceCheck::Replay => {
                tracing::debug!(subscription = %id, channel = %envelope.channel, sequence = envelope.sequence, "redelivered envelope");
            }
        }

        let handler = Arc::clone(&handler);
        let outcome = redelivery
            .retry(
                |_| {
                    let handler = Arc::clone(&handler);
                    let envelope = &envelope;
                    async move { handler.handle(envelope).await }
                },
                |_| !cancel.is_cancelled(),
            )
            .await;

        if let Err(exhausted) = outcome {
            tracing::error!(
                subscription = %id,
                channel = %envelope.channel,
                sequence = envelope.sequence,
                attempts = exhausted.attempts,
                error = %exhausted.last_error,
                "handler failed, envelope dead-lettered"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> BrokerConfig {
        BrokerConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..Default::default()
        }
    }

    /// 前 n 次投递返回瞬时失败的传输
    struct FlakyTransport {
        failures_left: AtomicUsize,
        inner: LocalTransport,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn deliver(&self, envelope: &Envelope) -> Result<usize, TransportError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Transient("network blip".to_string()));
            }
            self.inner.deliver(envelope).await
        }

        async fn attach(&self, pattern: ChannelPattern, sender: mpsc::Sender<Envelope>) -> SubscriptionId {
            self.inner.attach(pattern, sender).await
        }

        async fn detach(&self, id: SubscriptionId) -> bool {
            self.inner.detach(id).await
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe_preserves_order() {
        let broker = MessageBroker::new(fast_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = broker
            .subscribe(
                "conversation.c1.response",
                handler_fn(move |env: Envelope| {
                    let tx = tx.clone();
                    async move {
                        tx.send(env.sequence)?;
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        for i in 0..5 {
            let ack = broker
                .publish("conversation.c1.response", serde_json::json!({ "n": i }))
                .await
                .unwrap();
            assert_eq!(ack.sequence, i + 1);
            assert_eq!(ack.delivered, 1);
        }

        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(received, vec![1, 2, 3, 4, 5]);
        assert!(broker.unsubscribe(handle).await);
    }

    #[tokio::test]
    async fn test_publish_retries_transient_failures() {
        let transport = Arc::new(FlakyTransport {
            failures_left: AtomicUsize::new(2),
            inner: LocalTransport::new(),
        });
        let broker = MessageBroker::with_transport(fast_config(), transport);
        let ack = broker.publish("agent.echo.request", Value::Null).await.unwrap();
        assert_eq!(ack.attempts, 3);
    }

    #[tokio::test]
    async fn test_publish_exhausts_into_broker_unavailable() {
        let transport = Arc::new(FlakyTransport {
            failures_left: AtomicUsize::new(10),
            inner: LocalTransport::new(),
        });
        let broker = MessageBroker::with_transport(fast_config(), transport);
        let err = broker.publish("agent.echo.request", Value::Null).await.unwrap_err();
        assert!(matches!(err, BrokerError::BrokerUnavailable { attempts: 3, .. }));

        // 失败的发布同样占用序号
        assert_eq!(broker.last_sequence("agent.echo.request").await, 1);
    }

    #[tokio::test]
    async fn test_wildcard_publish_rejected() {
        let broker = MessageBroker::default();
        assert!(matches!(
            broker.publish("conversation.*.inbound", Value::Null).await,
            Err(BrokerError::InvalidPattern(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_handler_is_redelivered() {
        let broker = MessageBroker::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let _handle = broker
            .subscribe(
                "conversation.#",
                handler_fn(move |_env: Envelope| {
                    let counter = Arc::clone(&counter);
                    let done_tx = done_tx.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            anyhow::bail!("transient handler failure");
                        }
                        done_tx.send(())?;
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        broker.publish("conversation.c9.tasks", Value::Null).await.unwrap();
        done_rx.recv().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    /// 投递永不返回的传输
    #[derive(Default)]
    struct StuckTransport {
        inner: LocalTransport,
    }

    #[async_trait]
    impl Transport for StuckTransport {
        async fn deliver(&self, _envelope: &Envelope) -> Result<usize, TransportError> {
            std::future::pending().await
        }

        async fn attach(&self, pattern: ChannelPattern, sender: mpsc::Sender<Envelope>) -> SubscriptionId {
            self.inner.attach(pattern, sender).await
        }

        async fn detach(&self, id: SubscriptionId) -> bool {
            self.inner.detach(id).await
        }
    }

    #[tokio::test]
    async fn test_stuck_delivery_is_bounded() {
        let config = BrokerConfig {
            delivery_timeout_ms: 20,
            ..fast_config()
        };
        let broker = MessageBroker::with_transport(config, Arc::new(StuckTransport::default()));
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            broker.publish("conversation.c1.response", Value::Null),
        )
        .await
        .expect("publish must give up on a stuck transport")
        .unwrap_err();
        assert!(matches!(err, BrokerError::BrokerUnavailable { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_publish_after_close_fails_without_retrying() {
        let broker = MessageBroker::new(fast_config());
        broker.publish("conversation.c1.response", Value::Null).await.unwrap();
        broker.close().await;

        let err = broker.publish("conversation.c1.response", Value::Null).await.unwrap_err();
        match err {
            BrokerError::BrokerUnavailable { attempts, reason, .. } => {
                assert_eq!(attempts, 1);
                assert!(reason.contains("closed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
