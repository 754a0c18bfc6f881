//! 事件处理
//!
//! 轮询 crossterm 键盘事件，将 Ctrl+C / Ctrl+Q 转为 Command（Cancel / Quit）直接发送给运行时，
//! 其余按键交给 run_app 编辑输入缓冲，Enter 时 send_input。

use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tokio::sync::mpsc;

use crate::core::Command;

/// 应用事件：来自快捷键的 Command 或原始 KeyEvent
#[derive(Debug, Clone)]
pub enum AppEvent {
    Command(Command),
    Key(KeyEvent),
}

/// 事件处理器：持有 cmd_tx，poll 时读键盘并返回 AppEvent
pub struct EventHandler {
    cmd_tx: mpsc::UnboundedSender<Command>,
    poll_interval: Duration,
}

impl EventHandler {
    pub fn new(cmd_tx: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            cmd_tx,
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn poll(&self) -> anyhow::Result<Option<AppEvent>> {
        if event::poll(self.poll_interval)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(Some(self.handle_key(key)));
                }
            }
        }
        Ok(None)
    }

    fn handle_key(&self, key: KeyEvent) -> AppEvent {
        match shortcut(&key) {
            Some(cmd) => {
                let _ = self.cmd_tx.send(cmd.clone());
                AppEvent::Command(cmd)
            }
            None => AppEvent::Key(key),
        }
    }

    /// 提交一行输入；返回运行时是否仍在接收
    pub fn send_input(&self, line: String) -> bool {
        self.cmd_tx.send(Command::Input(line)).is_ok()
    }
}

/// 快捷键映射
fn shortcut(key: &KeyEvent) -> Option<Command> {
    if !key.modifiers.contains(KeyModifiers::CONTROL) {
        return None;
    }
    match key.code {
        KeyCode::Char('c') => Some(Command::Cancel),
        KeyCode::Char('q') | KeyCode::Char('d') => Some(Command::Quit),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shortcuts() {
        let ctrl = |c| KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL);
        assert_eq!(shortcut(&ctrl('c')), Some(Command::Cancel));
        assert_eq!(shortcut(&ctrl('q')), Some(Command::Quit));
        assert_eq!(shortcut(&ctrl('d')), Some(Command::Quit));
        assert_eq!(shortcut(&KeyEvent::new(KeyCode::Char('c'), KeyModifiers::NONE)), None);
    }
}
