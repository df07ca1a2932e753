//! 调度器：意图分类、路由策略、单轮调度、入站监听

pub mod classifier;
pub mod dispatch;
pub mod listener;
pub mod policy;

pub use classifier::{
    parse_candidates, ClassificationInput, HybridClassifier, IntentCandidate, IntentClassifier, KeywordClassifier,
    LlmClassifier,
};
pub use dispatch::{Dispatcher, Incoming};
pub use listener::{DispatchListener, ListenerHandle};
pub use policy::{ClassifierKind, DecisionReason, DispatcherConfig, RoutingDecision};
