//! 记忆层：消息模型、会话（历史 / 摘要 / 高水位）与会话持久化

pub mod conversation;
pub mod persistence;
pub mod session;

pub use conversation::{Message, Role, ToolCall};
pub use persistence::{SessionStore, SqliteSessionStore};
pub use session::{Session, SessionInfo, SessionManager, SessionMeta};
