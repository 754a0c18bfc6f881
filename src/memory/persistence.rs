//! 会话持久化
//!
//! SessionStore 是会话存储边界：会话记录的增删改查，以及唯一的元数据记录（最近使用的会话）。
//! SqliteSessionStore 用 rusqlite 实现：history 以 JSON 文本存储，时间戳为 RFC 3339（UTC）。

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::core::ChatError;
use crate::memory::session::{Session, SessionInfo, SessionMeta};

/// 会话存储；实现必须可在多个任务间共享
pub trait SessionStore: Send + Sync {
    /// 插入新会话，返回带分配 id 的副本
    fn create(&self, session: &Session) -> Result<Session, ChatError>;

    fn get(&self, id: i64) -> Result<Option<Session>, ChatError>;

    /// 覆盖已存在的会话；不存在时报错
    fn update(&self, session: &Session) -> Result<(), ChatError>;

    fn delete(&self, id: i64) -> Result<bool, ChatError>;

    /// 按最近更新时间倒序
    fn list(&self) -> Result<Vec<SessionInfo>, ChatError>;

    /// 读取元数据记录，不存在时创建
    fn meta(&self) -> Result<SessionMeta, ChatError>;

    fn update_meta(&self, meta: &SessionMeta) -> Result<(), ChatError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL DEFAULT '',
    model TEXT NOT NULL DEFAULT '',
    system_prompt TEXT NOT NULL DEFAULT '',
    summary TEXT NOT NULL DEFAULT '',
    history TEXT NOT NULL DEFAULT '[]',
    last_summarized_index INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS session_meta (
    id INTEGER PRIMARY KEY,
    latest_session_id INTEGER
);
";

/// SQLite 会话存储
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ChatError::Store(format!("Create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ChatError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ChatError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn index_to_sql(index: Option<usize>) -> Option<i64> {
    index.map(|i| i as i64)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<(Session, String)> {
    let last: Option<i64> = row.get("last_summarized_index")?;
    let created_at: DateTime<Utc> = row.get("created_at")?;
    let updated_at: DateTime<Utc> = row.get("updated_at")?;
    let session = Session {
        id: row.get("id")?,
        title: row.get("title")?,
        model: row.get("model")?,
        system_prompt: row.get("system_prompt")?,
        summary: row.get("summary")?,
        history: Vec::new(),
        last_summarized_index: last.and_then(|i| usize::try_from(i).ok()),
        created_at,
        updated_at,
    };
    Ok((session, row.get("history")?))
}

impl SessionStore for SqliteSessionStore {
    fn create(&self, session: &Session) -> Result<Session, ChatError> {
        let history = serde_json::to_string(&session.history)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sessions
             (title, model, system_prompt, summary, history, last_summarized_index, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session.title,
                session.model,
                session.system_prompt,
                session.summary,
                history,
                index_to_sql(session.last_summarized_index),
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
            ],
        )?;
        let mut created = session.clone();
        created.id = conn.last_insert_rowid();
        tracing::debug!(id = created.id, "session created");
        Ok(created)
    }

    fn get(&self, id: i64) -> Result<Option<Session>, ChatError> {
        let conn = self.conn();
        let found = conn
            .query_row(
                "SELECT * FROM sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()?;
        match found {
            Some((mut session, history)) => {
                session.history = serde_json::from_str(&history)
                    .map_err(|e| ChatError::Store(format!("Session {} history: {}", id, e)))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    fn update(&self, session: &Session) -> Result<(), ChatError> {
        let history = serde_json::to_string(&session.history)?;
        let changed = self.conn().execute(
            "UPDATE sessions SET title = ?1, model = ?2, system_prompt = ?3, summary = ?4,
             history = ?5, last_summarized_index = ?6, updated_at = ?7 WHERE id = ?8",
            params![
                session.title,
                session.model,
                session.system_prompt,
                session.summary,
                history,
                index_to_sql(session.last_summarized_index),
                session.updated_at.to_rfc3339(),
                session.id,
            ],
        )?;
        if changed == 0 {
            return Err(ChatError::Store(format!("Session {} not found", session.id)));
        }
        Ok(())
    }

    fn delete(&self, id: i64) -> Result<bool, ChatError> {
        let changed = self
            .conn()
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(changed == 1)
    }

    fn list(&self) -> Result<Vec<SessionInfo>, ChatError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, title, model, json_array_length(history), updated_at
             FROM sessions ORDER BY updated_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let count: i64 = row.get(3)?;
            Ok(SessionInfo {
                id: row.get(0)?,
                title: row.get(1)?,
                model: row.get(2)?,
                message_count: count.max(0) as usize,
                updated_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn meta(&self) -> Result<SessionMeta, ChatError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO session_meta (id, latest_session_id) VALUES (1, NULL)",
            [],
        )?;
        let meta = conn.query_row(
            "SELECT id, latest_session_id FROM session_meta WHERE id = 1",
            [],
            |row| {
                Ok(SessionMeta {
                    id: row.get(0)?,
                    latest_session_id: row.get(1)?,
                })
            },
        )?;
        Ok(meta)
    }

    fn update_meta(&self, meta: &SessionMeta) -> Result<(), ChatError> {
        self.conn().execute(
            "INSERT INTO session_meta (id, latest_session_id) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET latest_session_id = excluded.latest_session_id",
            params![meta.id, meta.latest_session_id],
        )?;
        Ok(())
    }
}
