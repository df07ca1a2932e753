//! 核心层：错误类型、组件装配与优雅关闭

pub mod builder;
pub mod error;
pub mod shutdown;

pub use builder::{Switchboard, SwitchboardBuilder};
pub use error::{
    AgentError, BrokerError, ClassifierError, MemoryError, RegistryError, TaskTransitionError, TransportError,
};
pub use shutdown::{
    register_switchboard, run_with_graceful_shutdown, AgentManagerCleanup, ListenerCleanup, ShutdownCleanup,
    ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
