//! mchat - 终端多轮对话客户端
//!
//! 模块划分：
//! - **commands**: 斜杠命令表、解析与补全
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、状态投影、turn 取消、任务调度、后台维护、主控循环
//! - **llm**: OpenAI 兼容传输层、流式重组、工具调用合并、补全引擎
//! - **memory**: 消息模型、会话与 SQLite 持久化
//! - **observability**: 文件日志
//! - **tools**: 工具注册、执行器，以及网页搜索 / 抓取 / 沙箱文件读写
//! - **ui**: Ratatui TUI 界面

pub mod commands;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
pub mod ui;
