//! 补全编排器：多轮「模型输出 → 执行工具 → 模型继续」循环
//!
//! 每轮：用完整的运行消息列表发起一次流式请求，逐行交给 StreamReassembler，思考 / 正文增量立即转发给调用方，
//! 工具分片交给 ToolCallMerger。流结束后若有完整工具调用，则追加 assistant(tool_calls) 与对应的 tool 消息，进入下一轮；
//! 否则本轮即整个 turn 结束。轮数达到上限仍未结束视为错误。任何终止性错误都会先发出一条 Error 事件。

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::ChatError;
use crate::llm::merge::ToolCallMerger;
use crate::llm::stream::{ChunkEvent, StreamReassembler};
use crate::llm::{ChatRequest, CompletionTransport, StreamEvent};
use crate::memory::{Message, ToolCall};
use crate::tools::ToolExecutor;

pub const DEFAULT_MAX_ROUNDS: usize = 8;

/// 一个 turn 的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutput {
    /// 所有轮次的可见文本拼接
    pub content: String,
    pub thinking: String,
    /// 实际发出的请求数
    pub rounds: usize,
    /// 执行过的工具调用总数
    pub tool_calls: usize,
}

/// 单轮读流的结果
#[derive(Default)]
struct RoundOutcome {
    content: String,
    thinking: String,
    calls: Vec<ToolCall>,
    stopped: bool,
}

/// 补全引擎：持有传输层与工具执行器
#[derive(Clone)]
pub struct CompletionEngine {
    transport: Arc<dyn CompletionTransport>,
    executor: ToolExecutor,
    max_rounds: usize,
}

impl CompletionEngine {
    pub fn new(transport: Arc<dyn CompletionTransport>, executor: ToolExecutor) -> Self {
        Self {
            transport,
            executor,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn transport(&self) -> Arc<dyn CompletionTransport> {
        Arc::clone(&self.transport)
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    /// 运行一个 turn；`messages` 为发送给模型的完整上下文（含 system 与本次 user 消息）
    pub async fn run_turn(
        &self,
        model: &str,
        messages: Vec<Message>,
        tools_enabled: bool,
        events: &mpsc::UnboundedSender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnOutput, ChatError> {
        let result = self
            .drive(model, messages, tools_enabled, events, &cancel)
            .await;
        if let Err(e) = &result {
            tracing::warn!(model = %model, error = %e, "turn ended with error");
            let _ = events.send(StreamEvent::Error {
                message: e.to_string(),
            });
        }
        result
    }

    async fn drive(
        &self,
        model: &str,
        mut messages: Vec<Message>,
        tools_enabled: bool,
        events: &mpsc::UnboundedSender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutput, ChatError> {
        let schemas = if tools_enabled {
            self.executor.registry().schemas()
        } else {
            Vec::new()
        };
        let mut output = TurnOutput::default();

        loop {
            if output.rounds >= self.max_rounds {
                return Err(ChatError::RoundLimit(self.max_rounds));
            }
            output.rounds += 1;
            tracing::debug!(round = output.rounds, messages = messages.len(), "sending request");

            let request = ChatRequest::streaming(model, messages.clone(), schemas.clone());
            let round = self.stream_round(&request, events, cancel).await?;
            output.content.push_str(&round.content);
            output.thinking.push_str(&round.thinking);

            if round.calls.is_empty() {
                if !round.stopped && round.content.is_empty() && round.thinking.is_empty() {
                    return Err(ChatError::EmptyTurn);
                }
                return Ok(output);
            }

            let calls = round.calls;
            messages.push(Message::assistant_tool_calls(calls.clone()));
            for call in &calls {
                let _ = events.send(StreamEvent::ToolCall { call: call.clone() });
            }
            let results = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                results = self.executor.execute_all(&calls) => results,
            };
            output.tool_calls += calls.len();
            let _ = events.send(StreamEvent::ToolComplete {
                summary: format!("{} tool(s) executed", calls.len()),
            });
            messages.extend(results);
        }
    }

    /// 发起一次流式请求并读完；流在返回时被 drop，连接随之关闭
    async fn stream_round(
        &self,
        request: &ChatRequest,
        events: &mpsc::UnboundedSender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<RoundOutcome, ChatError> {
        let mut lines = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            lines = self.transport.stream_lines(request) => lines?,
        };

        let mut reassembler = StreamReassembler::new();
        let mut merger = ToolCallMerger::new();
        let mut outcome = RoundOutcome::default();

        while !reassembler.is_finished() {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                next = lines.next() => next,
            };
            let Some(line) = next else { break };
            for event in reassembler.feed_line(&line?) {
                match event {
                    ChunkEvent::Thinking(text) => {
                        outcome.thinking.push_str(&text);
                        let _ = events.send(StreamEvent::Thinking { text });
                    }
                    ChunkEvent::Content(text) => {
                        outcome.content.push_str(&text);
                        let _ = events.send(StreamEvent::Content { text });
                    }
                    ChunkEvent::ToolFragments(fragments) => merger.extend(&fragments),
                    ChunkEvent::Stop => outcome.stopped = true,
                    ChunkEvent::ToolCallsRequested | ChunkEvent::Done => {}
                    ChunkEvent::Failed(e) => return Err(e),
                }
            }
        }

        if reassembler.skipped_lines() > 0 {
            tracing::debug!(skipped = reassembler.skipped_lines(), "stream had unparsable lines");
        }
        outcome.calls = merger.finish();
        Ok(outcome)
    }
}
