//! 工具参数 JSON Schema 生成（schemars 从参数结构体静态生成）
//!
//! 每个工具声明一个带 `JsonSchema` 的参数结构体，字段文档即参数描述；非 Option 且无默认值的字段为必填。

use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde_json::Value;

/// 生成 function.parameters 所需的 object schema（去掉 $schema / title）
pub fn parameters_schema<T: JsonSchema>() -> Value {
    let settings = SchemaSettings::draft07().with(|s| {
        s.option_add_null_type = false;
        s.inline_subschemas = true;
    });
    let root = settings.into_generator().into_root_schema_for::<T>();
    let mut value = serde_json::to_value(root).unwrap_or_else(|_| Value::Object(Default::default()));

    if let Value::Object(map) = &mut value {
        map.remove("$schema");
        map.remove("title");
        map.remove("definitions");
        map.entry("type").or_insert_with(|| Value::String("object".to_string()));
        map.entry("properties").or_insert_with(|| Value::Object(Default::default()));
        map.entry("required").or_insert_with(|| Value::Array(Vec::new()));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct SampleArgs {
        /// The search query
        query: String,
        /// Maximum number of results
        max_results: Option<u32>,
        #[serde(default)]
        verbose: bool,
    }

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct NoArgs {}

    #[test]
    fn test_properties_types_and_required() {
        let schema = parameters_schema::<SampleArgs>();
        assert_eq!(schema["type"], "object");
        assert!(schema.get("$schema").is_none());
        assert!(schema.get("title").is_none());
        assert_eq!(schema["properties"]["query"]["type"], "string");
        assert_eq!(schema["properties"]["query"]["description"], "The search query");
        assert_eq!(schema["properties"]["max_results"]["type"], "integer");
        assert_eq!(schema["properties"]["verbose"]["type"], "boolean");
        assert_eq!(schema["required"], serde_json::json!(["query"]));
    }

    #[test]
    fn test_empty_struct_has_required_array() {
        let schema = parameters_schema::<NoArgs>();
        assert_eq!(schema["required"], serde_json::json!([]));
        assert!(schema["properties"].is_object());
    }
}
