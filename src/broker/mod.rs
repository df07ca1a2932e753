//! 消息总线
//!
//! 发布 / 订阅传输，按会话分区频道；每个频道维护单调序号，
//! 瞬时失败按有界指数退避重试，投递语义为至少一次。

pub mod bus;
pub mod channel;
pub mod consumer;
pub mod retry;
pub mod transport;

pub use bus::{handler_fn, BrokerConfig, DeliveryAck, Envelope, FnHandler, MessageBroker, MessageHandler, SubscriptionHandle};
pub use channel::ChannelPattern;
pub use consumer::{MessageDeduplicator, SequenceCheck, SequenceTracker};
pub use retry::{BackoffPolicy, RetryExhausted};
pub use transport::{LocalTransport, SubscriptionId, Transport};
