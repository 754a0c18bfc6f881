//! 补全过程事件：思考增量、正文增量、工具调用、工具完成、错误
//!
//! Thinking / Content 的 text 一律是**增量**（delta），消费方自行拼接；不会出现「截至目前的全文」。

use serde::Serialize;

use crate::memory::ToolCall;

/// 对调用方暴露的语义事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// 推理内容增量（reasoning_content）
    Thinking { text: String },
    /// 可见回复增量
    Content { text: String },
    /// 即将执行的工具调用（每个调用一条）
    ToolCall { call: ToolCall },
    /// 本轮工具全部执行完毕
    ToolComplete { summary: String },
    /// 本轮终止性错误
    Error { message: String },
}
