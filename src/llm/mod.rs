//! LLM 层：传输抽象与实现（OpenAI 兼容 HTTP / Mock）、流重组、工具分片合并、多轮补全编排

pub mod completion;
pub mod events;
pub mod merge;
pub mod mock;
pub mod openai;
pub mod stream;
pub mod traits;

pub use completion::{CompletionEngine, TurnOutput, DEFAULT_MAX_ROUNDS};
pub use events::StreamEvent;
pub use merge::{merge_tool_calls, ToolCallFragment, ToolCallMerger};
pub use mock::{MockRound, MockTransport};
pub use openai::OpenAiClient;
pub use stream::{ChunkEvent, StreamReassembler};
pub use traits::{ChatRequest, CompletionTransport, LineStream};
