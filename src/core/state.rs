//! UI 状态投影
//!
//! UI 只持有轻量的 UiState（阶段、历史、实时流、提示、会话信息）；运行时每次变化后通过 watch 通道发布一份快照。
//! 实时流字段由 StreamEvent 增量拼接而成，turn 结束时清空。

use serde::Serialize;

use crate::llm::StreamEvent;
use crate::memory::Message;

/// 最多保留的提示条数
const MAX_NOTICES: usize = 50;

/// 对话阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ChatPhase {
    Idle,
    /// 已发送请求，尚未收到正文
    Thinking,
    Streaming,
    ToolExecuting,
    Error,
}

impl ChatPhase {
    pub fn label(&self) -> &'static str {
        match self {
            ChatPhase::Idle => "Idle",
            ChatPhase::Thinking => "Thinking",
            ChatPhase::Streaming => "Streaming",
            ChatPhase::ToolExecuting => "Running tools",
            ChatPhase::Error => "Error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NoticeLevel {
    Info,
    Warn,
    Error,
}

/// 命令输出与后台任务提示
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct UiState {
    pub phase: ChatPhase,
    pub history: Vec<Message>,
    /// 当前 turn 的推理增量拼接
    pub live_thinking: String,
    /// 当前 turn 的正文增量拼接
    pub live_content: String,
    /// 当前 turn 已发起的工具调用（name(args)）
    pub live_tools: Vec<String>,
    pub notices: Vec<Notice>,
    pub session_id: i64,
    pub title: String,
    pub model: String,
    pub tools_enabled: bool,
    pub input_locked: bool,
    pub error_message: Option<String>,
    /// 运行时已退出，UI 应随之退出
    pub quit: bool,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            phase: ChatPhase::Idle,
            history: Vec::new(),
            live_thinking: String::new(),
            live_content: String::new(),
            live_tools: Vec::new(),
            notices: Vec::new(),
            session_id: 0,
            title: String::new(),
            model: String::new(),
            tools_enabled: true,
            input_locked: false,
            error_message: None,
            quit: false,
        }
    }
}

impl UiState {
    pub fn notice(&mut self, level: NoticeLevel, text: impl Into<String>) {
        self.notices.push(Notice {
            level,
            text: text.into(),
        });
        if self.notices.len() > MAX_NOTICES {
            let excess = self.notices.len() - MAX_NOTICES;
            self.notices.drain(..excess);
        }
    }

    /// 开始一个 turn：清空实时字段并锁定输入
    pub fn begin_turn(&mut self) {
        self.live_thinking.clear();
        self.live_content.clear();
        self.live_tools.clear();
        self.error_message = None;
        self.phase = ChatPhase::Thinking;
        self.input_locked = true;
    }

    pub fn end_turn(&mut self, error: Option<String>) {
        self.live_thinking.clear();
        self.live_content.clear();
        self.live_tools.clear();
        self.input_locked = false;
        self.phase = if error.is_some() {
            ChatPhase::Error
        } else {
            ChatPhase::Idle
        };
        self.error_message = error;
    }

    /// 把一个补全事件并入实时字段
    pub fn apply_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Thinking { text } => {
                self.live_thinking.push_str(text);
                if self.phase != ChatPhase::Streaming {
                    self.phase = ChatPhase::Thinking;
                }
            }
            StreamEvent::Content { text } => {
                self.live_content.push_str(text);
                self.phase = ChatPhase::Streaming;
            }
            StreamEvent::ToolCall { call } => {
                self.live_tools.push(format!("{}({})", call.name, call.arguments));
                self.phase = ChatPhase::ToolExecuting;
            }
            StreamEvent::ToolComplete { summary } => {
                self.notice(NoticeLevel::Info, summary.clone());
                self.phase = ChatPhase::Thinking;
            }
            StreamEvent::Error { message } => {
                self.error_message = Some(message.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCall;

    #[test]
    fn test_deltas_are_concatenated() {
        let mut state = UiState::default();
        state.begin_turn();
        for text in ["Hel", "lo"] {
            state.apply_event(&StreamEvent::Content {
                text: text.to_string(),
            });
        }
        state.apply_event(&StreamEvent::Thinking {
            text: "hmm".to_string(),
        });
        assert_eq!(state.live_content, "Hello");
        assert_eq!(state.live_thinking, "hmm");
        assert_eq!(state.phase, ChatPhase::Streaming);
        assert!(state.input_locked);
    }

    #[test]
    fn test_tool_events_and_end_turn() {
        let mut state = UiState::default();
        state.begin_turn();
        state.apply_event(&StreamEvent::ToolCall {
            call: ToolCall {
                id: "c1".to_string(),
                name: "web_search".to_string(),
                arguments: "{\"query\":\"rust\"}".to_string(),
            },
        });
        assert_eq!(state.phase, ChatPhase::ToolExecuting);
        assert_eq!(state.live_tools, vec!["web_search({\"query\":\"rust\"})"]);
        state.apply_event(&StreamEvent::ToolComplete {
            summary: "1 tool(s) executed".to_string(),
        });
        assert_eq!(state.notices.last().unwrap().text, "1 tool(s) executed");

        state.end_turn(Some("boom".to_string()));
        assert_eq!(state.phase, ChatPhase::Error);
        assert!(state.live_tools.is_empty());
        assert!(!state.input_locked);
    }

    #[test]
    fn test_notices_are_bounded() {
        let mut state = UiState::default();
        for i in 0..(MAX_NOTICES + 5) {
            state.notice(NoticeLevel::Info, format!("n{}", i));
        }
        assert_eq!(state.notices.len(), MAX_NOTICES);
        assert_eq!(state.notices[0].text, "n5");
    }
}
