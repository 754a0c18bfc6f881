//! 工具执行器
//!
//! 同一轮的所有工具调用并发执行，结果按输入顺序返回；未知工具、参数不是合法 JSON、工具内部失败
//! 都转成以 "Error:" 开头的 tool 消息，而不是让整轮失败。每次调用输出结构化审计日志（JSON）。
//! 本层不加超时，超时由各工具自己的外部依赖（HTTP 客户端等）负责。

use std::time::Instant;

use futures_util::future::join_all;
use serde_json::Value;

use crate::memory::{Message, ToolCall};
use crate::tools::ToolRegistry;

/// 工具结果中的错误前缀，模型与界面都以此识别失败
pub const ERROR_MARKER: &str = "Error:";

/// 工具执行器
#[derive(Clone)]
pub struct ToolExecutor {
    registry: ToolRegistry,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 并发执行一轮工具调用；返回与输入一一对应、顺序相同的 tool 消息
    pub async fn execute_all(&self, calls: &[ToolCall]) -> Vec<Message> {
        join_all(calls.iter().map(|call| self.execute_one(call))).await
    }

    async fn execute_one(&self, call: &ToolCall) -> Message {
        let start = Instant::now();
        let outcome = self.run(call).await;
        let (ok, content) = match outcome {
            Ok(content) => (true, content),
            Err(reason) => (false, format!("{} {}", ERROR_MARKER, reason)),
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.id,
            "ok": ok,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        Message::tool(call.id.clone(), content)
    }

    async fn run(&self, call: &ToolCall) -> Result<String, String> {
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| format!("Unknown function '{}'", call.name))?;
        let args = parse_arguments(&call.arguments)?;
        tool.execute(args).await
    }
}

/// 参数必须是 JSON 对象；空字符串视为无参数
fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ Value::Object(_)) => Ok(v),
        Ok(_) => Err("Invalid JSON arguments - expected an object".to_string()),
        Err(e) => Err(format!("Invalid JSON arguments - {}", e)),
    }
}

fn args_preview(args: &str) -> String {
    if args.len() > 200 {
        format!("{}...", args.chars().take(200).collect::<String>())
    } else {
        args.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::memory::Role;
    use crate::tools::Tool;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo text"
        }
        async fn execute(&self, args: Value) -> Result<String, String> {
            Ok(args["text"].as_str().unwrap_or("").to_string())
        }
    }

    /// 按参数延迟返回，用于验证完成顺序不影响结果顺序
    struct Slow;

    #[async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleep then answer"
        }
        async fn execute(&self, args: Value) -> Result<String, String> {
            let ms = args["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(format!("slept {}", ms))
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            Err("disk on fire".to_string())
        }
    }

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(Echo);
        registry.register(Slow);
        registry.register(Broken);
        ToolExecutor::new(registry)
    }

    fn call(id: &str, name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_order_preserved() {
        let results = executor()
            .execute_all(&[
                call("c1", "echo", r#"{"text":"first"}"#),
                call("c2", "broken", "{}"),
                call("c3", "echo", r#"{"text":"third"}"#),
            ])
            .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|m| m.role == Role::Tool));
        assert_eq!(results[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(results[0].content_str(), "first");
        assert_eq!(results[1].tool_call_id.as_deref(), Some("c2"));
        assert!(results[1].content_str().starts_with(ERROR_MARKER));
        assert!(results[1].content_str().contains("disk on fire"));
        assert_eq!(results[2].content_str(), "third");
    }

    #[tokio::test]
    async fn test_results_follow_input_order_not_completion_order() {
        let results = executor()
            .execute_all(&[
                call("a", "slow", r#"{"ms":60}"#),
                call("b", "slow", r#"{"ms":1}"#),
            ])
            .await;
        assert_eq!(results[0].content_str(), "slept 60");
        assert_eq!(results[1].content_str(), "slept 1");
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_arguments() {
        let results = executor()
            .execute_all(&[
                call("u", "nope", "{}"),
                call("j", "echo", "{\"text\": "),
                call("n", "echo", "[1,2]"),
            ])
            .await;
        assert_eq!(results[0].content_str(), "Error: Unknown function 'nope'");
        assert!(results[1].content_str().starts_with("Error: Invalid JSON arguments"));
        assert!(results[2].content_str().starts_with("Error: Invalid JSON arguments"));
    }

    #[tokio::test]
    async fn test_empty_arguments_treated_as_empty_object() {
        let results = executor().execute_all(&[call("e", "echo", "")]).await;
        assert_eq!(results[0].content_str(), "");
    }
}
