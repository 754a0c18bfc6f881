//! 会话与会话管理
//!
//! Session 保存一段对话的全部状态：系统提示、滚动摘要、历史与摘要高水位 `last_summarized_index`。
//! SessionManager 是唯一的会话持有者，当前会话放在 `Arc<RwLock<Session>>` 中，前台轮次与后台维护任务共享同一把锁；
//! 切换会话时替换锁内的值，后台任务据 id 判断结果是否仍然适用。

use std::ops::Range;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::ChatError;
use crate::memory::persistence::SessionStore;
use crate::memory::Message;

const SUMMARY_PREFIX: &str = "\n\nPrevious conversation summary: ";

/// 一段对话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// 存储分配的 id；未入库时为 0
    pub id: i64,
    pub title: String,
    pub model: String,
    pub system_prompt: String,
    pub summary: String,
    pub history: Vec<Message>,
    /// 已并入 summary 的最后一条历史的下标；None 表示尚未摘要
    pub last_summarized_index: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            title: String::new(),
            model: model.into(),
            system_prompt: String::new(),
            summary: String::new(),
            history: Vec::new(),
            last_summarized_index: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 第一条尚未摘要的历史下标
    pub fn unsummarized_start(&self) -> usize {
        self.last_summarized_index
            .map_or(0, |i| i + 1)
            .min(self.history.len())
    }

    /// 待摘要的历史区间；`window_turns` 为保留原文的轮数（每轮两条消息）
    pub fn pending_summary_range(&self, window_turns: Option<usize>) -> Range<usize> {
        let start = self.unsummarized_start();
        let len = self.history.len();
        let boundary = match window_turns {
            Some(w) if w > 0 => len.saturating_sub(2 * w),
            _ => len,
        };
        start..boundary.max(start)
    }

    /// 发给模型的上下文：可选的 system 消息（系统提示 + 摘要）、未摘要的历史、本次用户输入
    pub fn build_messages(&self, user_input: &str) -> Vec<Message> {
        let mut system = self.system_prompt.clone();
        if !self.summary.is_empty() {
            system.push_str(SUMMARY_PREFIX);
            system.push_str(&self.summary);
        }

        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if !system.is_empty() {
            messages.push(Message::system(system));
        }
        messages.extend_from_slice(&self.history[self.unsummarized_start()..]);
        messages.push(Message::user(user_input));
        messages
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 清空历史、摘要与高水位；系统提示与标题保留
    pub fn clear(&mut self) {
        self.history.clear();
        self.summary.clear();
        self.last_summarized_index = None;
        self.touch();
    }
}

/// 会话列表项
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: i64,
    pub title: String,
    pub model: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// 唯一的元数据记录：下次启动要恢复的会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: i64,
    pub latest_session_id: Option<i64>,
}

/// 会话管理器：持有当前会话与存储
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    current: Arc<RwLock<Session>>,
}

impl SessionManager {
    /// 启动时加载：`continue_last` 且元数据指向的会话存在则恢复，否则新建
    pub fn load_or_create(
        store: Arc<dyn SessionStore>,
        model: &str,
        continue_last: bool,
    ) -> Result<Self, ChatError> {
        let mut meta = store.meta()?;
        let resumed = match meta.latest_session_id {
            Some(id) if continue_last => store.get(id)?,
            _ => None,
        };
        let session = match resumed {
            Some(session) => {
                tracing::info!(id = session.id, messages = session.history.len(), "resumed session");
                session
            }
            None => {
                let session = store.create(&Session::new(model))?;
                tracing::info!(id = session.id, "created session");
                session
            }
        };
        meta.latest_session_id = Some(session.id);
        store.update_meta(&meta)?;
        Ok(Self {
            store,
            current: Arc::new(RwLock::new(session)),
        })
    }

    /// 当前会话的共享句柄
    pub fn current(&self) -> Arc<RwLock<Session>> {
        Arc::clone(&self.current)
    }

    pub async fn snapshot(&self) -> Session {
        self.current.read().await.clone()
    }

    pub async fn id(&self) -> i64 {
        self.current.read().await.id
    }

    pub async fn build_messages(&self, user_input: &str) -> Vec<Message> {
        self.current.read().await.build_messages(user_input)
    }

    /// 记录一个 turn：用户消息总是写入；assistant 回复非空才写入
    pub async fn record_turn(&self, user_input: &str, reply: Option<&str>) {
        let mut session = self.current.write().await;
        session.history.push(Message::user(user_input));
        if let Some(reply) = reply.filter(|r| !r.is_empty()) {
            session.history.push(Message::assistant(reply));
        }
        session.touch();
    }

    /// 持久化当前会话，并把它记为最近会话
    pub async fn save(&self) -> Result<(), ChatError> {
        let snapshot = self.snapshot().await;
        self.store.update(&snapshot)?;
        self.remember_latest(snapshot.id)
    }

    fn remember_latest(&self, id: i64) -> Result<(), ChatError> {
        let mut meta = self.store.meta()?;
        if meta.latest_session_id != Some(id) {
            meta.latest_session_id = Some(id);
            self.store.update_meta(&meta)?;
        }
        Ok(())
    }

    /// 保存当前会话后新建一个并切换过去，返回新 id
    pub async fn new_session(&self, model: &str) -> Result<i64, ChatError> {
        let mut current = self.current.write().await;
        self.store.update(&current)?;
        let created = self.store.create(&Session::new(model))?;
        let id = created.id;
        *current = created;
        drop(current);
        self.remember_latest(id)?;
        Ok(id)
    }

    /// 保存当前会话后切换到 id
    pub async fn switch(&self, id: i64) -> Result<(), ChatError> {
        let mut current = self.current.write().await;
        if current.id == id {
            return Ok(());
        }
        let target = self
            .store
            .get(id)?
            .ok_or_else(|| ChatError::Store(format!("Session {} not found", id)))?;
        self.store.update(&current)?;
        *current = target;
        drop(current);
        self.remember_latest(id)
    }

    /// 删除会话；不允许删除当前会话
    pub async fn delete(&self, id: i64) -> Result<bool, ChatError> {
        if self.id().await == id {
            return Err(ChatError::Store("Cannot delete the active session".to_string()));
        }
        self.store.delete(id)
    }

    pub fn list(&self) -> Result<Vec<SessionInfo>, ChatError> {
        self.store.list()
    }

    pub async fn clear(&self) {
        self.current.write().await.clear();
    }

    pub async fn set_system_prompt(&self, prompt: &str) {
        let mut session = self.current.write().await;
        session.system_prompt = prompt.to_string();
        session.touch();
    }

    pub async fn set_model(&self, model: &str) {
        let mut session = self.current.write().await;
        session.model = model.to_string();
        session.touch();
    }

    pub async fn set_title(&self, title: &str) {
        let mut session = self.current.write().await;
        session.title = title.to_string();
        session.touch();
    }
}
