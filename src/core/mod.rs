//! 核心编排层：错误类型、状态投影、会话监管、任务调度、后台维护、主控循环

pub mod error;
pub mod maintenance;
pub mod orchestrator;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;

pub use error::ChatError;
pub use maintenance::{Maintenance, TitleTracker};
pub use orchestrator::{build_tools, create_runtime, ChatRuntime, Command, RuntimeSettings};
pub use session_supervisor::SessionSupervisor;
pub use state::{ChatPhase, Notice, NoticeLevel, UiState};
pub use task_scheduler::{TaskMode, TaskScheduler};
