//! 界面渲染
//!
//! 根据 UiState 绘制：顶部状态栏（阶段、模型、会话、工具开关），主体为对话历史与当前 turn 的实时流
//! （推理、工具调用、正文），其下为命令输出与后台提示，底部为输入框与快捷键提示。

use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState, Wrap},
    Frame,
};

use crate::core::{ChatPhase, NoticeLevel, UiState};
use crate::memory::{Message, Role};

/// 单条消息显示上限；工具结果整页内容超过此值会折叠
const MAX_DISPLAY_CHARS: usize = 4000;
const MAX_TOOL_DISPLAY_CHARS: usize = 280;
/// 提示区最多显示的行数
const NOTICE_LINES: usize = 8;

/// 对过长内容做折叠：保留前 N 字 + 省略提示
fn truncate_for_display(content: &str, limit: usize) -> String {
    let total = content.chars().count();
    if total <= limit {
        return content.to_string();
    }
    let head: String = content.chars().take(limit).collect();
    format!("{}\n... [{} chars omitted]", head, total - limit)
}

/// 按宽度换行（按字符数，不会切断 UTF-8）
fn wrap_text(s: &str, width: usize) -> Vec<String> {
    if width == 0 {
        return vec![s.to_string()];
    }
    let mut lines = Vec::new();
    for para in s.split('\n') {
        let mut line = String::new();
        for ch in para.chars() {
            if line.chars().count() >= width {
                lines.push(std::mem::take(&mut line));
            }
            line.push(ch);
        }
        lines.push(line);
    }
    lines
}

fn role_style(role: Role) -> (&'static str, Color) {
    match role {
        Role::User => ("You  ", Color::Cyan),
        Role::Assistant => ("AI   ", Color::Green),
        Role::System => ("Sys  ", Color::Gray),
        Role::Tool => ("Tool ", Color::Yellow),
    }
}

/// 消息的显示文本：携带工具调用的 assistant 消息只显示调用摘要
fn display_text(m: &Message) -> String {
    if !m.tool_calls.is_empty() {
        return m
            .tool_calls
            .iter()
            .map(|c| format!("→ {}({})", c.name, truncate_for_display(&c.arguments, 120)))
            .collect::<Vec<_>>()
            .join("\n");
    }
    let limit = if m.role == Role::Tool {
        MAX_TOOL_DISPLAY_CHARS
    } else {
        MAX_DISPLAY_CHARS
    };
    truncate_for_display(m.content_str(), limit)
}

fn push_block(lines: &mut Vec<Line<'static>>, prefix: &'static str, style: Style, text: &str, width: usize) {
    if !lines.is_empty() {
        lines.push(Line::from(""));
    }
    for (i, line) in wrap_text(text, width).into_iter().enumerate() {
        let pref = if i == 0 { prefix } else { "     " };
        lines.push(Line::from(vec![
            Span::styled(pref, style.add_modifier(Modifier::BOLD)),
            Span::styled(line, style.remove_modifier(Modifier::BOLD)),
        ]));
    }
}

/// 对话区内容：历史 + 当前 turn 的实时流
pub fn conversation_lines(state: &UiState, width: usize) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    for m in &state.history {
        let (prefix, color) = role_style(m.role);
        push_block(&mut lines, prefix, Style::default().fg(color), &display_text(m), width);
    }
    if !state.live_thinking.is_empty() {
        let style = Style::default()
            .fg(Color::DarkGray)
            .add_modifier(Modifier::ITALIC);
        push_block(&mut lines, "…    ", style, &state.live_thinking, width);
    }
    for call in &state.live_tools {
        push_block(
            &mut lines,
            "Tool ",
            Style::default().fg(Color::Yellow),
            &format!("→ {}", truncate_for_display(call, 120)),
            width,
        );
    }
    if !state.live_content.is_empty() {
        push_block(&mut lines, "AI   ", Style::default().fg(Color::Green), &state.live_content, width);
    }
    lines
}

fn notice_lines(state: &UiState) -> Vec<Line<'static>> {
    let mut lines: Vec<Line<'static>> = Vec::new();
    for notice in &state.notices {
        let color = match notice.level {
            NoticeLevel::Info => Color::Gray,
            NoticeLevel::Warn => Color::Yellow,
            NoticeLevel::Error => Color::Red,
        };
        for text in notice.text.split('\n') {
            lines.push(Line::from(Span::styled(text.to_string(), Style::default().fg(color))));
        }
    }
    let skip = lines.len().saturating_sub(NOTICE_LINES);
    lines.split_off(skip)
}

fn status_line(state: &UiState) -> Line<'static> {
    let phase_color = match state.phase {
        ChatPhase::Idle => Color::Green,
        ChatPhase::Error => Color::Red,
        _ => Color::Yellow,
    };
    let title = if state.title.is_empty() {
        "(untitled)".to_string()
    } else {
        state.title.clone()
    };
    let tools = if state.tools_enabled { "on" } else { "off" };
    Line::from(vec![
        Span::styled(
            format!(" {} ", state.phase.label()),
            Style::default().fg(Color::Black).bg(phase_color),
        ),
        Span::raw(format!(
            " {} │ #{} {} │ tools {} ",
            state.model, state.session_id, title, tools
        )),
    ])
}

/// 绘制一帧；将 (总行数, 可视高度) 写入 out 供外部 clamp 滚动
pub fn draw(
    f: &mut Frame,
    state: &UiState,
    input_buffer: &str,
    conversation_scroll: usize,
    out: &mut (usize, usize),
) {
    let notices = notice_lines(state);
    let notice_height = if notices.is_empty() {
        0
    } else {
        notices.len() as u16 + 2
    };
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(5),
            Constraint::Length(notice_height),
            Constraint::Length(3),
        ])
        .split(f.area());

    f.render_widget(Paragraph::new(status_line(state)), chunks[0]);

    let conv_area = chunks[1];
    // 边框 + 滚动条
    let content_width = conv_area.width.saturating_sub(3) as usize;
    let block = Block::default()
        .title(" mchat ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Blue));
    let text_lines = conversation_lines(state, content_width.saturating_sub(5).max(20));

    let content_height = conv_area.height.saturating_sub(2) as usize;
    let total_lines = text_lines.len();
    let scroll_offset = conversation_scroll.min(total_lines.saturating_sub(content_height));

    let paragraph = Paragraph::new(Text::from(text_lines))
        .block(block)
        .scroll((scroll_offset as u16, 0));
    f.render_widget(paragraph, conv_area);

    if total_lines > content_height {
        let mut scrollbar_state = ScrollbarState::new(total_lines)
            .position(scroll_offset)
            .viewport_content_length(content_height);
        let scrollbar = Scrollbar::new(ScrollbarOrientation::VerticalRight)
            .thumb_symbol("█")
            .track_symbol(Some("░"));
        f.render_stateful_widget(scrollbar, conv_area, &mut scrollbar_state);
    }

    if !notices.is_empty() {
        let notice_block = Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray));
        f.render_widget(Paragraph::new(Text::from(notices)).block(notice_block), chunks[2]);
    }

    let input_prompt = if let Some(err) = &state.error_message {
        format!(" Error: {} ", err.chars().take(60).collect::<String>())
    } else if state.input_locked {
        " Generating… ".to_string()
    } else {
        " Input ".to_string()
    };
    let border_color = if state.error_message.is_some() {
        Color::Red
    } else {
        Color::Blue
    };
    let hint = " Enter send │ Tab complete │ ↑↓ PgUp/PgDn scroll │ Ctrl+C cancel │ Ctrl+Q quit ";
    let input_block = Block::default()
        .title(input_prompt)
        .title_bottom(Line::from(Span::styled(hint, Style::default().fg(Color::DarkGray))))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color));
    let input = Paragraph::new(input_buffer)
        .block(input_block)
        .wrap(Wrap { trim: false })
        .style(if state.input_locked {
            Style::default().fg(Color::DarkGray)
        } else {
            Style::default()
        });
    f.render_widget(input, chunks[3]);

    out.0 = total_lines;
    out.1 = content_height;
}
