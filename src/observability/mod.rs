//! 可观测性：tracing 订阅器初始化
//!
//! 默认级别 info，可通过 RUST_LOG 覆盖。Task 审计行以 `audit` 字段输出 JSON。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogFormat;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 文本格式日志
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer())
        .try_init();
}

/// JSON 格式日志（每行一个事件，便于采集审计字段）
pub fn init_json() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().json().with_current_span(false))
        .try_init();
}

/// 按配置选择格式
pub fn init_with(format: LogFormat) {
    match format {
        LogFormat::Text => init(),
        LogFormat::Json => init_json(),
    }
}
