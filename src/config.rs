//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ORCHESTRATOR__MAX_ROUNDS=40`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub runtime: RuntimeSection,
    pub orchestrator: OrchestratorSection,
    pub logging: LoggingSection,
}

/// [runtime] 段
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSection {
    /// 不同 Agent 间同时执行的 Handler 上限
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_true")]
    pub ignore_unhandled_publish: bool,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            ignore_unhandled_publish: true,
        }
    }
}

fn default_max_concurrency() -> usize {
    8
}

fn default_true() -> bool {
    true
}

/// [orchestrator] 段：轮数、停滞与重规划上限
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// 连续多少轮无进展后触发重规划
    #[serde(default = "default_max_stalls")]
    pub max_stalls_before_replan: u32,
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    /// 整个任务的墙钟时间上限（秒），未设置则不限
    pub max_time_secs: Option<u64>,
    /// 设置后每轮对话会以 ChatUpdate 广播到该 topic 类型
    pub broadcast_topic: Option<String>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            max_stalls_before_replan: default_max_stalls(),
            max_replans: default_max_replans(),
            max_time_secs: None,
            broadcast_topic: None,
        }
    }
}

fn default_max_rounds() -> u32 {
    20
}

fn default_max_stalls() -> u32 {
    3
}

fn default_max_replans() -> u32 {
    3
}

/// [logging] 段：EnvFilter 语法，RUST_LOG 优先
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
