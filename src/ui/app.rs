//! TUI 应用主循环
//!
//! 进入全屏/原始模式，轮询 state_rx 与键盘事件，将用户输入与快捷键转为 Command 发送给运行时，
//! 每帧用 draw 渲染 UiState 与输入缓冲。运行时发布 quit 后退出（此时会话已落盘）。

use std::io::{self, Stdout};

use crossterm::event::KeyCode;
use crossterm::{
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use tokio::sync::{mpsc, watch};

use crate::commands;
use crate::core::{Command, UiState};
use crate::ui::event::{AppEvent, EventHandler};
use crate::ui::render::draw;

/// 输入缓冲与 Tab 补全状态
#[derive(Debug, Default)]
pub struct InputState {
    pub buffer: String,
    /// 正在循环的候选：(用户键入的前缀, 下一个候选下标)
    completion: Option<(String, usize)>,
}

impl InputState {
    pub fn push(&mut self, c: char) {
        self.completion = None;
        self.buffer.push(c);
    }

    pub fn pop(&mut self) {
        self.completion = None;
        self.buffer.pop();
    }

    /// 取出整行并清空
    pub fn take(&mut self) -> String {
        self.completion = None;
        std::mem::take(&mut self.buffer)
    }

    /// 斜杠命令补全：唯一候选直接补全并加空格，多个候选时每按一次 Tab 换下一个
    pub fn complete(&mut self) {
        let (prefix, next) = match &self.completion {
            Some((prefix, next)) => (prefix.clone(), *next),
            None => (self.buffer.clone(), 0),
        };
        let candidates = commands::completions(&prefix);
        match candidates.len() {
            0 => {}
            1 => {
                self.buffer = format!("/{} ", candidates[0]);
                self.completion = None;
            }
            n => {
                self.buffer = format!("/{}", candidates[next % n]);
                self.completion = Some((prefix, next + 1));
            }
        }
    }
}

/// 运行 TUI：启用原始模式与全屏，循环 poll 事件 + 渲染，退出时恢复终端
pub async fn run_app(
    mut state_rx: watch::Receiver<UiState>,
    cmd_tx: mpsc::UnboundedSender<Command>,
) -> anyhow::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = event_loop(&mut terminal, &mut state_rx, EventHandler::new(cmd_tx)).await;
    restore_terminal(&mut terminal)?;
    result
}

async fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    state_rx: &mut watch::Receiver<UiState>,
    events: EventHandler,
) -> anyhow::Result<()> {
    let mut input = InputState::default();
    let mut conversation_scroll = usize::MAX;
    let mut last_len = 0usize;

    loop {
        // 运行时已退出（发送端被丢弃）时也结束
        if state_rx.has_changed().is_err() {
            break;
        }
        let state = state_rx.borrow_and_update().clone();
        if state.quit {
            break;
        }

        // 新消息或实时流增长时跟随到底部
        let len = state.history.len() + state.live_content.len() + state.live_thinking.len();
        if len != last_len {
            last_len = len;
            conversation_scroll = usize::MAX;
        }

        if let Some(AppEvent::Key(key)) = events.poll()? {
            match key.code {
                KeyCode::Enter => {
                    let line = input.take();
                    if !line.trim().is_empty() && !events.send_input(line) {
                        break;
                    }
                }
                KeyCode::Tab => input.complete(),
                KeyCode::Backspace => input.pop(),
                KeyCode::Char(c) => input.push(c),
                KeyCode::Up => conversation_scroll = conversation_scroll.saturating_sub(1),
                KeyCode::Down => conversation_scroll = conversation_scroll.saturating_add(1),
                KeyCode::PageUp => conversation_scroll = conversation_scroll.saturating_sub(10),
                KeyCode::PageDown => conversation_scroll = conversation_scroll.saturating_add(10),
                KeyCode::Home => conversation_scroll = 0,
                KeyCode::End => conversation_scroll = usize::MAX,
                _ => {}
            }
        }

        let mut scroll_info = (0usize, 0usize);
        terminal.draw(|f| {
            draw(f, &state, &input.buffer, conversation_scroll, &mut scroll_info);
        })?;
        let (total_lines, viewport_height) = scroll_info;
        conversation_scroll = conversation_scroll.min(total_lines.saturating_sub(viewport_height));

        tokio::task::yield_now().await;
    }
    Ok(())
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> anyhow::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_completion_appends_space() {
        let mut input = InputState::default();
        for c in "/he".chars() {
            input.push(c);
        }
        input.complete();
        assert_eq!(input.buffer, "/help ");
    }

    #[test]
    fn test_completion_cycles_candidates() {
        let mut input = InputState::default();
        for c in "/s".chars() {
            input.push(c);
        }
        let candidates = commands::completions("/s");
        assert!(candidates.len() > 1);

        input.complete();
        assert_eq!(input.buffer, format!("/{}", candidates[0]));
        input.complete();
        assert_eq!(input.buffer, format!("/{}", candidates[1]));

        input.push('x');
        assert!(input.buffer.ends_with('x'));
        assert_eq!(input.take(), format!("/{}x", candidates[1]));
        assert!(input.buffer.is_empty());
    }

    #[test]
    fn test_plain_text_is_not_completed() {
        let mut input = InputState::default();
        input.push('h');
        input.complete();
        assert_eq!(input.buffer, "h");
    }
}
