//! 工具调用分片合并
//!
//! 流式响应把一个工具调用拆成多个分片（按 index 归属）：id 只出现一次，name 可能被拆开，
//! arguments 逐 token 到达。合并器按 index 建槽位，结束时只输出拿到 id 的槽位。

use serde::Deserialize;

use crate::memory::ToolCall;

/// 单轮最多接受的工具调用槽位；index 超出的分片被丢弃
pub const MAX_TOOL_CALL_SLOTS: usize = 128;

/// delta.tool_calls 中的单个分片
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ToolCallFragment {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionFragment>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FunctionFragment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// 按 index 累积分片的合并器
#[derive(Debug, Default)]
pub struct ToolCallMerger {
    slots: Vec<Slot>,
}

impl ToolCallMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &ToolCallFragment) {
        let idx = fragment.index;
        if idx >= MAX_TOOL_CALL_SLOTS {
            tracing::warn!(index = idx, "tool call fragment index out of range, skipped");
            return;
        }
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, Slot::default);
        }
        let slot = &mut self.slots[idx];

        // id 一旦出现即固定
        if slot.id.is_none() {
            if let Some(id) = fragment.id.as_deref().filter(|id| !id.is_empty()) {
                slot.id = Some(id.to_string());
            }
        }
        if let Some(function) = &fragment.function {
            if let Some(name) = &function.name {
                slot.name.push_str(name);
            }
            if let Some(arguments) = &function.arguments {
                slot.arguments.push_str(arguments);
            }
        }
    }

    pub fn extend<'a>(&mut self, fragments: impl IntoIterator<Item = &'a ToolCallFragment>) {
        for fragment in fragments {
            self.push(fragment);
        }
    }

    /// 输出完整调用（按 index 顺序）；没有 id 的槽位视为被放弃，静默丢弃
    pub fn finish(self) -> Vec<ToolCall> {
        self.slots
            .into_iter()
            .filter_map(|slot| {
                slot.id.map(|id| ToolCall {
                    id,
                    name: slot.name,
                    arguments: slot.arguments,
                })
            })
            .collect()
    }
}

/// 一次性合并一组分片
pub fn merge_tool_calls(fragments: &[ToolCallFragment]) -> Vec<ToolCall> {
    let mut merger = ToolCallMerger::new();
    merger.extend(fragments);
    merger.finish()
}
