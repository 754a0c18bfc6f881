//! 应用配置：从 {config_dir}/mchat/config.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件（显式路径优先，否则用默认位置），再用环境变量 `MCHAT__*` 覆盖
//! （双下划线表示嵌套，如 `MCHAT__LLM__MODEL=gpt-4o-mini`）。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::ChatError;

const APP_DIR: &str = "mchat";

/// 应用配置根
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

/// [llm] 段：远端服务与模型
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
    /// 未设置时回退到 OPENAI_API_KEY
    pub api_key: Option<String>,
    /// 摘要与标题使用的模型，未设置时用当前模型
    pub summary_model: Option<String>,
    /// 请求超时（秒），未设置则不限
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

fn default_max_tool_rounds() -> usize {
    8
}

/// [session] 段：历史窗口与后台任务间隔
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// 原文保留的轮数；未设置时每次都把全部历史并入摘要
    pub max_history_turns: Option<usize>,
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
    #[serde(default = "default_title_interval_secs")]
    pub title_interval_secs: u64,
    #[serde(default = "default_continue_last_session")]
    pub continue_last_session: bool,
    pub db_path: Option<PathBuf>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_history_turns: None,
            save_interval_secs: default_save_interval_secs(),
            title_interval_secs: default_title_interval_secs(),
            continue_last_session: default_continue_last_session(),
            db_path: None,
        }
    }
}

fn default_save_interval_secs() -> u64 {
    300
}

fn default_title_interval_secs() -> u64 {
    600
}

fn default_continue_last_session() -> bool {
    true
}

/// [tools] 段：文件系统根、抓取超时、结果截断
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 沙箱根目录，未设置时用当前目录
    pub filesystem_root: Option<PathBuf>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    #[serde(default)]
    pub search: SearchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            filesystem_root: None,
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_result_chars: default_max_result_chars(),
            search: SearchSection::default(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_result_chars() -> usize {
    8000
}

/// [tools.search] 段：Google Custom Search 凭据
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    pub google_api_key: Option<String>,
    pub google_search_engine_id: Option<String>,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            google_api_key: None,
            google_search_engine_id: None,
            max_results: default_max_results(),
        }
    }
}

fn default_max_results() -> u32 {
    5
}

impl AppConfig {
    /// 必填项检查
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.llm.base_url.trim().is_empty() {
            return Err(ChatError::Config("llm.base_url is required".to_string()));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ChatError::Config("llm.model is required".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.llm.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    pub fn db_path(&self) -> PathBuf {
        self.session
            .db_path
            .clone()
            .unwrap_or_else(|| data_dir().join("sessions.db"))
    }

    pub fn filesystem_root(&self) -> PathBuf {
        self.tools
            .filesystem_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// 0 或未设置表示不启用窗口
    pub fn history_window(&self) -> Option<usize> {
        self.session.max_history_turns.filter(|w| *w > 0)
    }
}

/// 默认配置文件位置
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("config.toml")
}

/// 数据目录（数据库与日志）
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// 加载配置：TOML 文件 + 环境变量 MCHAT__*，随后校验必填项
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ChatError> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    load_from(&path, "MCHAT")
}

fn load_from(path: &Path, env_prefix: &str) -> Result<AppConfig, ChatError> {
    let mut builder = config::Config::builder();
    if path.exists() {
        builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
    } else {
        tracing::warn!(path = %path.display(), "config file not found, relying on environment");
    }
    builder = builder.add_source(
        config::Environment::with_prefix(env_prefix)
            .separator("__")
            .try_parsing(true),
    );

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}
