//! 对话运行时：主控循环
//!
//! 负责：根据配置创建传输层、工具、会话存储与维护任务；建立 cmd/state 两个通道，并在后台任务中消费用户命令
//! （输入、取消、退出），驱动补全引擎、更新 UI 状态、调度摘要 / 标题 / 保存任务。
//! 每个 turn 在独立任务中运行，主循环同时等待命令、流事件与 turn 结束，因此 Ctrl+C 可以随时取消。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::commands::{self, Input, SlashCommand};
use crate::config::AppConfig;
use crate::core::maintenance::Maintenance;
use crate::core::state::{NoticeLevel, UiState};
use crate::core::task_scheduler::{TaskMode, TaskScheduler};
use crate::core::{ChatError, SessionSupervisor};
use crate::llm::{CompletionEngine, CompletionTransport, OpenAiClient, StreamEvent, TurnOutput};
use crate::memory::{Message, SessionManager, SessionStore, SqliteSessionStore};
use crate::tools::{
    ExtractWebPageTool, ReadFileTool, SafeFs, ToolExecutor, ToolRegistry, WebSearchTool,
    WriteFileTool,
};

pub const SUMMARIZE_TASK: &str = "summarize";
pub const SAVE_TASK: &str = "save";
pub const TITLE_TASK: &str = "title";

/// 后台失败的轮询间隔
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);
/// /history 中每条消息显示的最大字符数
const HISTORY_PREVIEW_CHARS: usize = 200;

/// 从 UI 发往运行时的用户命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 一行输入：普通消息或斜杠命令
    Input(String),
    /// 取消当前生成（Ctrl+C）
    Cancel,
    /// 保存并退出
    Quit,
}

/// 运行时参数
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub save_interval: Duration,
    pub title_interval: Duration,
}

impl RuntimeSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            save_interval: Duration::from_secs(cfg.session.save_interval_secs.max(1)),
            title_interval: Duration::from_secs(cfg.session.title_interval_secs.max(1)),
        }
    }
}

enum Flow {
    Continue,
    Quit,
}

struct PendingTurn {
    input: String,
    handle: JoinHandle<Result<TurnOutput, ChatError>>,
}

async fn wait_turn(
    pending: &mut Option<PendingTurn>,
) -> Result<Result<TurnOutput, ChatError>, JoinError> {
    match pending {
        Some(turn) => (&mut turn.handle).await,
        None => std::future::pending().await,
    }
}

/// 根据配置注册工具；HTTP 客户端无法创建时报错
pub fn build_tools(cfg: &AppConfig) -> Result<ToolRegistry, ChatError> {
    let fs = SafeFs::new(cfg.filesystem_root());
    let mut tools = ToolRegistry::new();
    tools.register(WebSearchTool::new(
        cfg.tools.search.google_api_key.clone(),
        cfg.tools.search.google_search_engine_id.clone(),
        cfg.tools.search.max_results,
        cfg.tools.fetch_timeout_secs,
    )?);
    tools.register(ExtractWebPageTool::new(
        cfg.tools.fetch_timeout_secs,
        cfg.tools.max_result_chars,
    )?);
    tools.register(ReadFileTool::new(fs.clone()));
    tools.register(WriteFileTool::new(fs));
    Ok(tools)
}

/// 根据配置创建运行时：HTTP 传输、工具、SQLite 会话存储
pub async fn create_runtime(cfg: &AppConfig) -> Result<ChatRuntime, ChatError> {
    let transport: Arc<dyn CompletionTransport> = Arc::new(OpenAiClient::new(
        &cfg.llm.base_url,
        cfg.llm.api_key.as_deref(),
        cfg.request_timeout(),
    )?);
    let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::open(cfg.db_path())?);
    let sessions =
        SessionManager::load_or_create(store, &cfg.llm.model, cfg.session.continue_last_session)?;

    // 恢复的会话沿用自己的模型；配置中的模型只用于新会话
    let engine = CompletionEngine::new(Arc::clone(&transport), ToolExecutor::new(build_tools(cfg)?))
        .with_max_rounds(cfg.llm.max_tool_rounds);
    let maintenance = Maintenance::new(
        sessions.clone(),
        transport,
        cfg.llm.summary_model.clone(),
        cfg.history_window(),
    );
    tracing::info!(base_url = %cfg.llm.base_url, model = %cfg.llm.model, "runtime created");
    Ok(ChatRuntime::new(engine, sessions, maintenance, RuntimeSettings::from_config(cfg)).await)
}

/// 对话运行时
pub struct ChatRuntime {
    engine: CompletionEngine,
    sessions: SessionManager,
    maintenance: Maintenance,
    scheduler: TaskScheduler,
    supervisor: SessionSupervisor,
    settings: RuntimeSettings,
    state: UiState,
    state_tx: watch::Sender<UiState>,
    tools_enabled: bool,
}

impl ChatRuntime {
    pub async fn new(
        engine: CompletionEngine,
        sessions: SessionManager,
        maintenance: Maintenance,
        settings: RuntimeSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(UiState::default());
        let mut runtime = Self {
            engine,
            sessions,
            maintenance,
            scheduler: TaskScheduler::new(),
            supervisor: SessionSupervisor::new(),
            settings,
            state: UiState::default(),
            state_tx,
            tools_enabled: true,
        };
        runtime.state.tools_enabled = runtime.tools_enabled;
        runtime.refresh_session_view().await;
        runtime.mark_existing_title().await;
        runtime
    }

    pub fn subscribe(&self) -> watch::Receiver<UiState> {
        self.state_tx.subscribe()
    }

    /// 在后台运行主循环；返回命令发送端与任务句柄（句柄结束即会话已落盘）
    pub fn spawn(self) -> (mpsc::UnboundedSender<Command>, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(cmd_rx));
        (cmd_tx, handle)
    }

    pub async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        self.start_background_jobs();
        self.publish();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<StreamEvent>();
        let mut pending: Option<PendingTurn> = None;
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let flow = match cmd {
                        Some(Command::Input(line)) => {
                            self.handle_input(&line, &event_tx, &mut pending).await
                        }
                        Some(Command::Cancel) => {
                            if self.supervisor.cancel() {
                                tracing::info!("turn cancelled by user");
                            }
                            Flow::Continue
                        }
                        Some(Command::Quit) | None => Flow::Quit,
                    };
                    if matches!(flow, Flow::Quit) {
                        break;
                    }
                }
                Some(event) = event_rx.recv() => {
                    self.state.apply_event(&event);
                    self.publish();
                }
                joined = wait_turn(&mut pending) => {
                    while let Ok(event) = event_rx.try_recv() {
                        self.state.apply_event(&event);
                    }
                    if let Some(turn) = pending.take() {
                        self.finish_turn(turn.input, joined).await;
                    }
                }
                _ = housekeeping.tick() => self.housekeeping().await,
            }
        }

        if let Some(turn) = pending.take() {
            self.supervisor.cancel();
            let joined = turn.handle.await;
            self.finish_turn(turn.input, joined).await;
        }
        self.shutdown().await;
    }

    fn publish(&self) {
        let _ = self.state_tx.send(self.state.clone());
    }

    fn info(&mut self, text: impl Into<String>) {
        self.state.notice(NoticeLevel::Info, text);
    }

    fn warn(&mut self, text: impl Into<String>) {
        self.state.notice(NoticeLevel::Warn, text);
    }

    fn error(&mut self, text: impl Into<String>) {
        self.state.notice(NoticeLevel::Error, text);
    }

    async fn refresh_session_view(&mut self) {
        let handle = self.sessions.current();
        let session = handle.read().await;
        self.state.history = session.history.clone();
        self.state.session_id = session.id;
        self.state.title = session.title.clone();
        self.state.model = session.model.clone();
    }

    /// 已有标题的会话不在启动 / 切换后立即重新生成标题
    async fn mark_existing_title(&self) {
        let handle = self.sessions.current();
        let session = handle.read().await;
        if !session.title.is_empty() {
            self.maintenance
                .titles()
                .mark(session.id, session.history.len());
        }
    }

    fn start_background_jobs(&self) {
        let m = self.maintenance.clone();
        self.scheduler.schedule(SAVE_TASK, TaskMode::Interval(self.settings.save_interval), move || {
            let m = m.clone();
            async move {
                m.save().await?;
                Ok(())
            }
        });
        self.start_title_job();
    }

    fn start_title_job(&self) {
        let m = self.maintenance.clone();
        self.scheduler.schedule(TITLE_TASK, TaskMode::Interval(self.settings.title_interval), move || {
            let m = m.clone();
            async move {
                m.refresh_title().await?;
                Ok(())
            }
        });
    }

    fn schedule_summary(&mut self) {
        let m = self.maintenance.clone();
        let previous = self.scheduler.schedule(SUMMARIZE_TASK, TaskMode::Exclusive, move || {
            let m = m.clone();
            async move {
                m.summarize().await?;
                Ok(())
            }
        });
        if let Some(failure) = previous {
            self.warn(format!("Conversation summary failed: {}", failure));
        }
    }

    /// 报告周期任务的失败，并同步后台生成的标题
    async fn housekeeping(&mut self) {
        let mut changed = false;
        for (task, label) in [(SAVE_TASK, "Session save"), (TITLE_TASK, "Title generation")] {
            if let Some(failure) = self.scheduler.take_failure(task) {
                self.warn(format!("{} failed: {}", label, failure));
                changed = true;
            }
        }
        let title = self.sessions.current().read().await.title.clone();
        if title != self.state.title {
            self.state.title = title;
            changed = true;
        }
        if changed {
            self.publish();
        }
    }

    async fn handle_input(
        &mut self,
        line: &str,
        event_tx: &mpsc::UnboundedSender<StreamEvent>,
        pending: &mut Option<PendingTurn>,
    ) -> Flow {
        let busy = pending.is_some();
        let flow = match commands::parse(line) {
            Ok(None) => Flow::Continue,
            Err(msg) => {
                self.error(msg);
                Flow::Continue
            }
            Ok(Some(Input::Message(_))) if busy => {
                self.warn("Still generating; press Ctrl+C to cancel first");
                Flow::Continue
            }
            Ok(Some(Input::Message(text))) => {
                *pending = Some(self.start_turn(text, event_tx).await);
                Flow::Continue
            }
            Ok(Some(Input::Command(cmd))) if busy && !read_only(&cmd) => {
                self.warn("Command unavailable while generating; press Ctrl+C to cancel first");
                Flow::Continue
            }
            Ok(Some(Input::Command(cmd))) => match self.run_command(cmd).await {
                Ok(flow) => flow,
                Err(e) => {
                    tracing::warn!(error = %e, "command failed");
                    self.error(format!("Command failed: {}", e));
                    Flow::Continue
                }
            },
        };
        self.publish();
        flow
    }

    async fn start_turn(
        &mut self,
        text: String,
        event_tx: &mpsc::UnboundedSender<StreamEvent>,
    ) -> PendingTurn {
        let (messages, model) = {
            let handle = self.sessions.current();
            let session = handle.read().await;
            (session.build_messages(&text), session.model.clone())
        };
        let cancel = self.supervisor.begin_turn();
        self.state.begin_turn();
        self.state.history.push(Message::user(text.clone()));
        tracing::info!(model = %model, context = messages.len(), tools = self.tools_enabled, "turn started");

        let engine = self.engine.clone();
        let events = event_tx.clone();
        let tools_enabled = self.tools_enabled;
        let handle = tokio::spawn(async move {
            engine
                .run_turn(&model, messages, tools_enabled, &events, cancel)
                .await
        });
        PendingTurn {
            input: text,
            handle,
        }
    }

    /// turn 结束：写入历史（出错时只写用户消息），然后调度摘要
    async fn finish_turn(
        &mut self,
        input: String,
        joined: Result<Result<TurnOutput, ChatError>, JoinError>,
    ) {
        self.supervisor.end_turn();
        let result = joined.unwrap_or_else(|e| {
            if e.is_cancelled() {
                Err(ChatError::Cancelled)
            } else {
                Err(ChatError::Protocol(format!("turn task failed: {}", e)))
            }
        });
        match result {
            Ok(output) => {
                tracing::info!(
                    rounds = output.rounds,
                    tool_calls = output.tool_calls,
                    chars = output.content.len(),
                    "turn finished"
                );
                self.sessions.record_turn(&input, Some(&output.content)).await;
                self.state.end_turn(None);
            }
            Err(e) => {
                self.sessions.record_turn(&input, None).await;
                self.state.end_turn(Some(e.to_string()));
            }
        }
        self.refresh_session_view().await;
        self.schedule_summary();
        self.publish();
    }

    async fn run_command(&mut self, cmd: SlashCommand) -> Result<Flow, ChatError> {
        match cmd {
            SlashCommand::Help => {
                let mut text = commands::help_text();
                let tools = self.engine.executor().registry().tool_descriptions();
                if !tools.is_empty() {
                    text.push_str("\nTools:");
                    for (name, description) in tools {
                        text.push_str(&format!("\n  {}  {}", name, description));
                    }
                }
                self.info(text);
            }
            SlashCommand::Quit => return Ok(Flow::Quit),
            SlashCommand::Tools => {
                self.tools_enabled = !self.tools_enabled;
                self.state.tools_enabled = self.tools_enabled;
                let status = if self.tools_enabled { "on" } else { "off" };
                self.info(format!("Tools are turned {}", status));
            }
            SlashCommand::System(None) => {
                let prompt = self.sessions.snapshot().await.system_prompt;
                if prompt.is_empty() {
                    self.info("System prompt: (empty)");
                } else {
                    self.info(format!("System prompt:\n{}", prompt));
                }
            }
            SlashCommand::System(Some(prompt)) => {
                self.sessions.set_system_prompt(&prompt).await;
                self.info(if prompt.is_empty() {
                    "System prompt cleared"
                } else {
                    "System prompt updated"
                });
            }
            SlashCommand::Clear => {
                // 进行中的摘要 / 标题请求基于旧历史，直接作废
                self.scheduler.cancel(SUMMARIZE_TASK);
                self.scheduler.cancel(TITLE_TASK);
                self.sessions.clear().await;
                self.start_title_job();
                self.info("Conversation history cleared");
            }
            SlashCommand::History => {
                let session = self.sessions.snapshot().await;
                if session.history.is_empty() {
                    self.info("Conversation history: (empty)");
                } else {
                    let lines: Vec<String> = session
                        .history
                        .iter()
                        .map(|m| format!("{}:{}", m.role.as_str(), preview(m.content_str())))
                        .collect();
                    self.info(format!("Conversation history:\n{}", lines.join("\n")));
                }
            }
            SlashCommand::Summary => {
                let session = self.sessions.snapshot().await;
                let covered = session.last_summarized_index.map_or(0, |i| i + 1);
                if session.summary.is_empty() {
                    self.info("No summary yet");
                } else {
                    self.info(format!(
                        "Summary (covers {} of {} messages):\n{}",
                        covered,
                        session.history.len(),
                        session.summary
                    ));
                }
            }
            SlashCommand::Models => {
                let models = self.engine.transport().list_models().await?;
                let current = self.state.model.clone();
                let lines: Vec<String> = models
                    .iter()
                    .map(|m| {
                        let mark = if *m == current { "*" } else { " " };
                        format!("{}{}", mark, m)
                    })
                    .collect();
                self.info(format!("Available models:\n{}", lines.join("\n")));
            }
            SlashCommand::Model(name) => {
                let models = self.engine.transport().list_models().await?;
                if models.iter().any(|m| *m == name) {
                    self.sessions.set_model(&name).await;
                    self.info(format!("Model switched to {}", name));
                } else {
                    self.error(format!("Model `{}` not found!", name));
                }
            }
            SlashCommand::New => {
                self.scheduler.cancel(SUMMARIZE_TASK);
                let model = self.state.model.clone();
                let id = self.sessions.new_session(&model).await?;
                self.info(format!("Started session #{}", id));
            }
            SlashCommand::Sessions => {
                let current = self.state.session_id;
                let lines: Vec<String> = self
                    .sessions
                    .list()?
                    .into_iter()
                    .map(|s| {
                        let mark = if s.id == current { "*" } else { " " };
                        let title = if s.title.is_empty() { "(untitled)" } else { s.title.as_str() };
                        format!(
                            "{}#{} {} [{}, {} messages, {}]",
                            mark,
                            s.id,
                            title,
                            s.model,
                            s.message_count,
                            s.updated_at.format("%Y-%m-%d %H:%M")
                        )
                    })
                    .collect();
                self.info(format!("Sessions:\n{}", lines.join("\n")));
            }
            SlashCommand::Switch(id) => {
                self.scheduler.cancel(SUMMARIZE_TASK);
                self.sessions.switch(id).await?;
                self.mark_existing_title().await;
                self.info(format!("Switched to session #{}", id));
            }
            SlashCommand::Delete(id) => {
                if self.sessions.delete(id).await? {
                    self.info(format!("Deleted session #{}", id));
                } else {
                    self.warn(format!("Session #{} not found", id));
                }
            }
            SlashCommand::Title(None) => {
                let title = self.state.title.clone();
                self.info(if title.is_empty() {
                    "Title: (untitled)".to_string()
                } else {
                    format!("Title: {}", title)
                });
            }
            SlashCommand::Title(Some(title)) => {
                self.sessions.set_title(&title).await;
                self.sessions.save().await?;
                self.mark_existing_title().await;
                self.info("Title updated");
            }
        }
        self.refresh_session_view().await;
        Ok(Flow::Continue)
    }

    /// 退出：取消所有后台任务，落盘当前会话
    async fn shutdown(&mut self) {
        self.supervisor.cancel();
        self.scheduler.cancel_all();
        match self.sessions.save().await {
            Ok(()) => tracing::info!("session saved on exit"),
            Err(e) => tracing::error!(error = %e, "failed to save session on exit"),
        }
        self.state.quit = true;
        self.publish();
    }
}

/// 生成中也允许执行的只读命令
fn read_only(cmd: &SlashCommand) -> bool {
    matches!(
        cmd,
        SlashCommand::Help
            | SlashCommand::Quit
            | SlashCommand::History
            | SlashCommand::Summary
            | SlashCommand::Sessions
            | SlashCommand::Title(None)
            | SlashCommand::System(None)
    )
}

fn preview(text: &str) -> String {
    if text.chars().count() > HISTORY_PREVIEW_CHARS {
        format!("{}…", text.chars().take(HISTORY_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}
