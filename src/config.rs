//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SWITCHBOARD__*` 覆盖
//! （双下划线表示嵌套，如 `SWITCHBOARD__DISPATCHER__MARGIN=0.2`）。
//! 各段直接反序列化为对应组件构造时接收的配置结构。

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::agents::AgentManagerConfig;
use crate::broker::BrokerConfig;
use crate::dispatcher::DispatcherConfig;
use crate::memory::MemoryConfig;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "SWITCHBOARD";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub broker: BrokerConfig,
    pub memory: MemoryConfig,
    pub agents: AgentManagerConfig,
    pub dispatcher: DispatcherConfig,
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// [app] 段：应用名、命令行会话的参与者、日志格式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 命令行模式下的用户标识
    pub participant_id: String,
    pub log_format: LogFormat,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "switchboard".to_string(),
            participant_id: "local-user".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl AppConfig {
    /// SQLite 路径（memory.db_path）
    pub fn db_path(&self) -> Option<PathBuf> {
        self.memory.db_path.as_ref().map(PathBuf::from)
    }
}

/// 从 config 目录加载配置，环境变量 SWITCHBOARD__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SWITCHBOARD__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
        } else {
            tracing::warn!("Config file {:?} not found, ignored", path);
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
