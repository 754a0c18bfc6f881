//! Web 工具：web_search（Google Custom Search JSON API）与 extract_web_page（抓取网页正文）
//!
//! 两者都用带超时与 User-Agent 的 reqwest Client；对 HTML 响应使用 html2text 提取可读文本，
//! 结果超过 max_result_chars 时截断并追加 ...[truncated]。

use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::ChatError;
use crate::tools::schema::parameters_schema;
use crate::tools::Tool;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
const GOOGLE_SEARCH_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";

fn build_client(timeout_secs: u64) -> Result<Client, ChatError> {
    let client = Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(USER_AGENT)
        .build()?;
    Ok(client)
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 判断内容是否像 HTML（需提取可读文本）
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    let head: String = s.chars().take(512).collect::<String>().to_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html") || head.contains("<head") || head.contains("<body")
}

/// HTML 转可读文本，去掉空行与行首尾空白
fn html_to_text(html: &str) -> String {
    let text = match from_read(html.as_bytes(), 120) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => strip_html_tags(html),
    };
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_chars(body: String, max_chars: usize) -> String {
    if body.chars().count() > max_chars {
        body.chars().take(max_chars).collect::<String>() + "\n...[truncated]"
    } else {
        body
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WebSearchArgs {
    /// The search query
    query: String,
    /// Maximum number of results to return (default: 5, at most 10)
    max_results: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: String,
}

fn format_results(items: &[SearchItem]) -> String {
    if items.is_empty() {
        return "No results found.".to_string();
    }
    items
        .iter()
        .map(|r| format!("Title: {}\nURL: {}\nSnippet: {}\n---", r.title, r.link, r.snippet))
        .collect::<Vec<_>>()
        .join("\n")
}

/// web_search：调用 Google Custom Search；未配置 key / engine id 时返回错误文本
pub struct WebSearchTool {
    client: Client,
    api_key: Option<String>,
    engine_id: Option<String>,
    default_max_results: u32,
}

impl WebSearchTool {
    pub fn new(
        api_key: Option<String>,
        engine_id: Option<String>,
        default_max_results: u32,
        timeout_secs: u64,
    ) -> Result<Self, ChatError> {
        Ok(Self {
            client: build_client(timeout_secs)?,
            api_key: api_key.filter(|k| !k.is_empty()),
            engine_id: engine_id.filter(|k| !k.is_empty()),
            default_max_results,
        })
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Perform a web search. Returns title, URL and snippet for each result, separated by \"---\" dividers."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<WebSearchArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: WebSearchArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {}", e))?;
        let (Some(key), Some(cx)) = (&self.api_key, &self.engine_id) else {
            return Err("Web search is not configured".to_string());
        };
        let query = args.query.trim();
        if query.is_empty() {
            return Err("Missing query".to_string());
        }
        let num = args.max_results.unwrap_or(self.default_max_results).clamp(1, 10);
        tracing::info!(query = %query, num, "web_search");

        let resp = self
            .client
            .get(GOOGLE_SEARCH_ENDPOINT)
            .query(&[
                ("key", key.as_str()),
                ("cx", cx.as_str()),
                ("q", query),
                ("num", &num.to_string()),
            ])
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body: SearchResponse = resp
            .json()
            .await
            .map_err(|e| format!("Invalid search response: {}", e))?;
        Ok(format_results(&body.items))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ExtractArgs {
    /// The URL of the web page to extract text from
    url: String,
}

/// extract_web_page：抓取 URL 并返回可读正文
pub struct ExtractWebPageTool {
    client: Client,
    max_result_chars: usize,
}

impl ExtractWebPageTool {
    pub fn new(timeout_secs: u64, max_result_chars: usize) -> Result<Self, ChatError> {
        Ok(Self {
            client: build_client(timeout_secs)?,
            max_result_chars,
        })
    }

    async fn fetch(&self, url: &str) -> Result<String, String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Failed to fetch from `{}`: {}", url, e))?;
        if !resp.status().is_success() {
            return Err(format!("Failed to fetch from `{}`: HTTP {}", url, resp.status()));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| format!("Failed to read `{}`: {}", url, e))?;
        let body = body.trim_start_matches('\u{FEFF}');

        let text = if looks_like_html(body) {
            html_to_text(body)
        } else {
            body.to_string()
        };
        Ok(truncate_chars(text, self.max_result_chars))
    }
}

#[async_trait]
impl Tool for ExtractWebPageTool {
    fn name(&self) -> &str {
        "extract_web_page"
    }

    fn description(&self) -> &str {
        "Extract text content from a web page given its URL"
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<ExtractArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ExtractArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {}", e))?;
        let url = args.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("Unsupported URL: {}", url));
        }
        tracing::info!(url = %url, "extract_web_page");
        self.fetch(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_detection_and_extraction() {
        let html = "<!DOCTYPE html><html><head><title>T</title></head><body><p>Hello</p>\n\n<p>World</p></body></html>";
        assert!(looks_like_html(html));
        assert!(!looks_like_html("{\"json\": true}"));
        let text = html_to_text(html);
        assert!(text.contains("Hello"));
        assert!(text.contains("World"));
        assert!(!text.lines().any(|l| l.trim().is_empty()));
    }

    #[test]
    fn test_strip_html_tags_fallback() {
        assert_eq!(strip_html_tags("<b>bold</b>  and <i>it</i>"), "bold and it");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abc".to_string(), 5), "abc");
        assert_eq!(truncate_chars("abcdef".to_string(), 3), "abc\n...[truncated]");
    }

    #[test]
    fn test_format_results() {
        let items = vec![SearchItem {
            title: "Rust".to_string(),
            link: "https://rust-lang.org".to_string(),
            snippet: "A language".to_string(),
        }];
        assert_eq!(
            format_results(&items),
            "Title: Rust\nURL: https://rust-lang.org\nSnippet: A language\n---"
        );
        assert_eq!(format_results(&[]), "No results found.");
    }

    #[tokio::test]
    async fn test_search_not_configured() {
        let tool = WebSearchTool::new(None, Some(String::new()), 5, 5).unwrap();
        let err = tool.execute(serde_json::json!({"query": "rust"})).await.unwrap_err();
        assert_eq!(err, "Web search is not configured");
    }

    #[tokio::test]
    async fn test_extract_rejects_non_http_url() {
        let tool = ExtractWebPageTool::new(5, 100).unwrap();
        let err = tool
            .execute(serde_json::json!({"url": "file:///etc/passwd"}))
            .await
            .unwrap_err();
        assert!(err.starts_with("Unsupported URL"));
        let err = tool.execute(serde_json::json!({})).await.unwrap_err();
        assert!(err.starts_with("Invalid arguments"));
    }

    #[test]
    fn test_schemas_declare_required_fields() {
        let search = WebSearchTool::new(None, None, 5, 5).unwrap();
        assert_eq!(search.parameters_schema()["required"], serde_json::json!(["query"]));
        let extract = ExtractWebPageTool::new(5, 100).unwrap();
        assert_eq!(extract.parameters_schema()["required"], serde_json::json!(["url"]));
    }
}
