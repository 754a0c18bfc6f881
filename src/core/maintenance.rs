//! 会话维护任务：滚动摘要、标题生成、定期保存
//!
//! 三者都通过传输层的非流式补全（或存储）工作，由 TaskScheduler 在后台调度。摘要与标题先在读锁下取快照，
//! 释放锁后发请求，再在写锁下一次性写回；若期间会话被切换或清空，结果直接丢弃。

use std::sync::{Arc, Mutex};

use crate::core::ChatError;
use crate::llm::CompletionTransport;
use crate::memory::{Message, SessionManager};

/// 标题提示中最多带入的消息条数
const TITLE_CONTEXT_MESSAGES: usize = 6;

fn flatten(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}:{}", m.role.as_str(), m.content_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn summary_prompt(previous_summary: &str, recent: &str) -> String {
    format!(
        "Summarize this conversation, incorporating the previous summary if provided.\n\n\
         Previous summary: {previous_summary}\n\n\
         Recent conversation:\n{recent}\n\n\
         Create a concise summary (2-3 sentences) that:\n\
         - Incorporates key points from the previous summary\n\
         - Adds important new topics and conclusions\n\
         - Maintains context needed for future messages\n\n\
         Summary:"
    )
}

fn title_prompt(conversation: &str) -> String {
    format!(
        "Generate a short title (at most 6 words) for the following conversation. \
         Reply with the title only, without quotes or punctuation at the end.\n\n{conversation}"
    )
}

/// 去掉模型常加的引号与首尾空白
fn clean_title(raw: &str) -> String {
    let quotes: &[char] = &['"', '\'', '`', '“', '”', '‘', '’', '«', '»'];
    let first_line = raw.trim().lines().next().unwrap_or("");
    first_line
        .trim()
        .trim_matches(quotes)
        .trim()
        .trim_end_matches('.')
        .to_string()
}

/// 记录上次生成标题时的 (会话 id, 历史长度)
#[derive(Debug, Default)]
pub struct TitleTracker {
    last: Mutex<Option<(i64, usize)>>,
}

impl TitleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 历史自上次生成后是否有变化（增长，或清空后重新开始）
    pub fn needs_title(&self, session_id: i64, history_len: usize) -> bool {
        if history_len == 0 {
            return false;
        }
        match *self.lock() {
            Some((id, len)) if id == session_id => history_len != len,
            _ => true,
        }
    }

    pub fn mark(&self, session_id: i64, history_len: usize) {
        *self.lock() = Some((session_id, history_len));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(i64, usize)>> {
        self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 维护任务的依赖；Clone 后交给各个后台任务
#[derive(Clone)]
pub struct Maintenance {
    sessions: SessionManager,
    transport: Arc<dyn CompletionTransport>,
    summary_model: Option<String>,
    window_turns: Option<usize>,
    titles: Arc<TitleTracker>,
}

impl Maintenance {
    pub fn new(
        sessions: SessionManager,
        transport: Arc<dyn CompletionTransport>,
        summary_model: Option<String>,
        window_turns: Option<usize>,
    ) -> Self {
        Self {
            sessions,
            transport,
            summary_model: summary_model.filter(|m| !m.is_empty()),
            window_turns,
            titles: Arc::new(TitleTracker::new()),
        }
    }

    pub fn titles(&self) -> Arc<TitleTracker> {
        Arc::clone(&self.titles)
    }

    fn model_for(&self, session_model: &str) -> String {
        self.summary_model
            .clone()
            .unwrap_or_else(|| session_model.to_string())
    }

    /// 把高水位之后、窗口之前的历史并入摘要；返回是否写入了新摘要
    pub async fn summarize(&self) -> Result<bool, ChatError> {
        let handle = self.sessions.current();
        let (session_id, range, previous_index, previous_summary, slice, model) = {
            let session = handle.read().await;
            let range = session.pending_summary_range(self.window_turns);
            if range.is_empty() {
                return Ok(false);
            }
            (
                session.id,
                range.clone(),
                session.last_summarized_index,
                session.summary.clone(),
                session.history[range].to_vec(),
                self.model_for(&session.model),
            )
        };

        tracing::info!(session = session_id, from = range.start, to = range.end, model = %model, "summarizing");
        let prompt = summary_prompt(&previous_summary, &flatten(&slice));
        let summary = self
            .transport
            .complete(&model, &[Message::user(prompt)])
            .await?;

        let mut session = handle.write().await;
        let unchanged = session.id == session_id
            && session.last_summarized_index == previous_index
            && session.history.len() >= range.end;
        if !unchanged {
            tracing::info!(session = session_id, "session changed during summarization, discarding");
            return Ok(false);
        }
        session.summary = summary.trim().to_string();
        session.last_summarized_index = Some(range.end - 1);
        session.touch();
        Ok(true)
    }

    /// 历史有增长时重新生成标题并保存；返回新标题
    pub async fn refresh_title(&self) -> Result<Option<String>, ChatError> {
        let handle = self.sessions.current();
        let (session_id, history_len, context, model) = {
            let session = handle.read().await;
            if !self.titles.needs_title(session.id, session.history.len()) {
                return Ok(None);
            }
            let mut context = String::new();
            if !session.summary.is_empty() {
                context.push_str(&format!("summary:{}\n", session.summary));
            }
            let start = session.history.len().saturating_sub(TITLE_CONTEXT_MESSAGES);
            context.push_str(&flatten(&session.history[start..]));
            (
                session.id,
                session.history.len(),
                context,
                self.model_for(&session.model),
            )
        };

        let raw = self
            .transport
            .complete(&model, &[Message::user(title_prompt(&context))])
            .await?;
        let title = clean_title(&raw);
        self.titles.mark(session_id, history_len);
        if title.is_empty() {
            return Ok(None);
        }

        {
            let mut session = handle.write().await;
            // 请求期间被切换或清空时，标题针对的是旧历史
            if session.id != session_id || session.history.len() < history_len {
                tracing::info!(session = session_id, "session changed during title generation, discarding");
                return Ok(None);
            }
            session.title = title.clone();
            session.touch();
        }
        self.sessions.save().await?;
        tracing::info!(session = session_id, title = %title, "title updated");
        Ok(Some(title))
    }

    pub async fn save(&self) -> Result<(), ChatError> {
        self.sessions.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::core::{TaskMode, TaskScheduler};
    use crate::llm::{ChatRequest, LineStream, MockTransport};
    use crate::memory::{SessionStore, SqliteSessionStore};

    /// complete 永不返回，用于观察取消
    struct HangingTransport {
        started: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl CompletionTransport for HangingTransport {
        async fn stream_lines(&self, _request: &ChatRequest) -> Result<LineStream, ChatError> {
            Err(ChatError::Transport("not streaming".to_string()))
        }

        async fn complete(&self, _model: &str, _messages: &[Message]) -> Result<String, ChatError> {
            self.started.notify_one();
            std::future::pending().await
        }

        async fn list_models(&self) -> Result<Vec<String>, ChatError> {
            Ok(vec![])
        }
    }

    /// 模拟请求进行中用户执行了 /clear
    struct ClearingTransport {
        sessions: SessionManager,
    }

    #[async_trait]
    impl CompletionTransport for ClearingTransport {
        async fn stream_lines(&self, _request: &ChatRequest) -> Result<LineStream, ChatError> {
            Err(ChatError::Transport("not streaming".to_string()))
        }

        async fn complete(&self, _model: &str, _messages: &[Message]) -> Result<String, ChatError> {
            self.sessions.clear().await;
            Ok("Old Topic".to_string())
        }

        async fn list_models(&self) -> Result<Vec<String>, ChatError> {
            Ok(vec![])
        }
    }

    async fn seeded_sessions() -> SessionManager {
        let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::open_in_memory().unwrap());
        let sessions = SessionManager::load_or_create(store, "chat-model", true).unwrap();
        {
            let handle = sessions.current();
            let mut s = handle.write().await;
            s.summary = "Old summary".to_string();
            for i in 1..=3 {
                s.history.push(Message::user(format!("Msg {}", i)));
                s.history.push(Message::assistant(format!("Reply {}", i)));
            }
        }
        sessions
    }

    async fn setup(mock: MockTransport, window: Option<usize>) -> (Maintenance, Arc<MockTransport>) {
        let sessions = seeded_sessions().await;
        let mock = Arc::new(mock);
        let maintenance = Maintenance::new(
            sessions,
            mock.clone(),
            Some("summary-model".to_string()),
            window,
        );
        (maintenance, mock)
    }

    #[tokio::test]
    async fn test_summarize_respects_window() {
        let (m, mock) = setup(
            MockTransport::new().with_completion(Ok(" New summary ".to_string())),
            Some(2),
        )
        .await;
        assert!(m.summarize().await.unwrap());

        let calls = mock.completion_calls();
        assert_eq!(calls.len(), 1);
        let (model, messages) = &calls[0];
        assert_eq!(model, "summary-model");
        let prompt = messages[0].content_str();
        assert!(prompt.contains("Old summary"));
        assert!(prompt.contains("user:Msg 1"));
        assert!(prompt.contains("assistant:Reply 1"));
        assert!(!prompt.contains("Msg 3"));

        let s = m.sessions.snapshot().await;
        assert_eq!(s.summary, "New summary");
        assert_eq!(s.last_summarized_index, Some(1));

        // 窗口已满足，不再发请求
        assert!(!m.summarize().await.unwrap());
        assert_eq!(mock.completion_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_summarize_without_window_covers_everything() {
        let (m, _mock) = setup(MockTransport::new().with_completion(Ok("All".to_string())), None).await;
        assert!(m.summarize().await.unwrap());
        assert_eq!(m.sessions.snapshot().await.last_summarized_index, Some(5));
    }

    #[tokio::test]
    async fn test_summarize_failure_leaves_state_untouched() {
        let (m, _mock) = setup(
            MockTransport::new().with_completion(Err("timeout".to_string())),
            None,
        )
        .await;
        assert!(m.summarize().await.is_err());
        let s = m.sessions.snapshot().await;
        assert_eq!(s.summary, "Old summary");
        assert_eq!(s.last_summarized_index, None);
    }

    #[tokio::test]
    async fn test_summarize_follows_active_session() {
        let (m, mock) = setup(MockTransport::new().with_completion(Ok("stale".to_string())), None).await;
        m.sessions.new_session("chat-model").await.unwrap();
        // 新会话为空，不会发请求
        assert!(!m.summarize().await.unwrap());
        assert!(mock.completion_calls().is_empty());
    }

    #[tokio::test]
    async fn test_summary_high_water_mark_only_grows() {
        let (m, mock) = setup(
            MockTransport::new()
                .with_completion(Ok("First".to_string()))
                .with_completion(Ok("Second".to_string())),
            Some(1),
        )
        .await;
        assert!(m.summarize().await.unwrap());
        let first = m.sessions.snapshot().await.last_summarized_index;
        // 6 条历史，保留最近 1 轮
        assert_eq!(first, Some(3));

        m.sessions.record_turn("Msg 4", Some("Reply 4")).await;
        m.sessions.record_turn("Msg 5", Some("Reply 5")).await;
        assert!(m.summarize().await.unwrap());
        let s = m.sessions.snapshot().await;
        assert_eq!(s.history.len(), 10);
        assert_eq!(s.last_summarized_index, Some(7));
        assert!(s.last_summarized_index > first);
        assert_eq!(s.summary, "Second");

        // 第二次只带入上次高水位之后的部分
        let calls = mock.completion_calls();
        let prompt = calls[1].1[0].content_str();
        assert!(prompt.contains("Previous summary: First"));
        assert!(prompt.contains("user:Msg 3"));
        assert!(!prompt.contains("Msg 2"));
        assert!(!prompt.contains("Msg 5"));
    }

    #[tokio::test]
    async fn test_cancelled_summary_leaves_session_untouched() {
        let sessions = seeded_sessions().await;
        let started = Arc::new(tokio::sync::Notify::new());
        let transport = Arc::new(HangingTransport {
            started: Arc::clone(&started),
        });
        let m = Maintenance::new(sessions.clone(), transport, None, None);

        let scheduler = TaskScheduler::new();
        let job = m.clone();
        scheduler.schedule("summarize", TaskMode::Exclusive, move || {
            let m = job.clone();
            async move {
                m.summarize().await?;
                Ok(())
            }
        });
        tokio::time::timeout(Duration::from_secs(5), started.notified())
            .await
            .unwrap();

        scheduler.cancel("summarize");
        assert!(!scheduler.is_running("summarize"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let s = sessions.snapshot().await;
        assert_eq!(s.summary, "Old summary");
        assert_eq!(s.last_summarized_index, None);
        assert_eq!(s.history.len(), 6);
        assert!(scheduler.take_failure("summarize").is_none());
    }

    #[tokio::test]
    async fn test_title_discarded_after_clear() {
        let sessions = seeded_sessions().await;
        let transport = Arc::new(ClearingTransport {
            sessions: sessions.clone(),
        });
        let m = Maintenance::new(sessions.clone(), transport, None, None);

        assert_eq!(m.refresh_title().await.unwrap(), None);
        let s = sessions.snapshot().await;
        assert!(s.history.is_empty());
        assert_eq!(s.title, "");

        // 清空后的新对话仍会获得标题
        sessions.record_turn("hello", Some("hi")).await;
        assert!(m.titles().needs_title(s.id, 2));
    }

    #[tokio::test]
    async fn test_title_generated_once_per_growth() {
        let (m, mock) = setup(
            MockTransport::new()
                .with_completion(Ok("\"Counting Messages\"\n".to_string()))
                .with_completion(Ok("Second".to_string())),
            None,
        )
        .await;
        assert_eq!(m.refresh_title().await.unwrap().as_deref(), Some("Counting Messages"));
        assert_eq!(m.sessions.snapshot().await.title, "Counting Messages");
        assert_eq!(m.refresh_title().await.unwrap(), None);
        assert_eq!(mock.completion_calls().len(), 1);

        m.sessions.record_turn("more", Some("sure")).await;
        assert_eq!(m.refresh_title().await.unwrap().as_deref(), Some("Second"));

        let stored = m.sessions.list().unwrap();
        assert_eq!(stored[0].title, "Second");
    }

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("  'Rust tips'  "), "Rust tips");
        assert_eq!(clean_title("“Quoted.”\nextra"), "Quoted");
        assert_eq!(clean_title(""), "");
    }

    #[test]
    fn test_title_tracker() {
        let t = TitleTracker::new();
        assert!(!t.needs_title(1, 0));
        assert!(t.needs_title(1, 2));
        t.mark(1, 2);
        assert!(!t.needs_title(1, 2));
        assert!(t.needs_title(1, 4));
        assert!(t.needs_title(2, 2));
        // 清空后重新积累到更短的历史
        t.mark(1, 6);
        assert!(t.needs_title(1, 2));
    }
}
