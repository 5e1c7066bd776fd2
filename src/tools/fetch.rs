//! fetch_url：只读抓取白名单域名上的文档页
//!
//! 域名匹配允许子域（`docs.rs` 覆盖 `www.docs.rs`）；HTML 响应经 html2text 转为纯文本，
//! 结果按字符数截断。

use async_trait::async_trait;
use regex::Regex;
use reqwest::{header, Client, Url};
use serde_json::{json, Value};

use crate::llm::openai::build_client;
use crate::tools::{Tool, ToolContext};

/// 允许访问的域名集合
#[derive(Debug, Clone)]
pub struct DomainAllowlist {
    domains: Vec<String>,
}

impl DomainAllowlist {
    pub fn new(domains: impl IntoIterator<Item = String>) -> Self {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.trim().trim_start_matches("*.").to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// 解析 URL 并校验 scheme 与 host
    pub fn permit(&self, raw: &str) -> Result<Url, String> {
        let url = Url::parse(raw.trim()).map_err(|e| format!("invalid url '{raw}': {e}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("unsupported scheme '{}'", url.scheme()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| format!("url '{raw}' has no host"))?
            .to_lowercase();
        let allowed = self
            .domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")));
        if !allowed {
            return Err(format!("domain '{host}' is not in the fetch allowlist"));
        }
        Ok(url)
    }
}

pub struct FetchUrlTool {
    client: Result<Client, String>,
    allowlist: DomainAllowlist,
    max_chars: usize,
}

impl FetchUrlTool {
    pub fn new(allowed_domains: Vec<String>, timeout_secs: u64, max_result_chars: usize) -> Self {
        let client = build_client(timeout_secs, concat!("coda/", env!("CARGO_PKG_VERSION")));
        Self {
            client,
            allowlist: DomainAllowlist::new(allowed_domains),
            max_chars: max_result_chars,
        }
    }

    async fn get_text(&self, url: Url) -> Result<Value, String> {
        let client = self.client.as_ref().map_err(Clone::clone)?;
        let resp = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| format!("request to {url} failed: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("{url} returned HTTP {status}"));
        }
        let is_html = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("html"))
            .unwrap_or(false);
        let body = resp
            .text()
            .await
            .map_err(|e| format!("failed to read body of {url}: {e}"))?;
        let body = body.trim_start_matches('\u{feff}');
        let text = if is_html || sniff_html(body) {
            html_to_text(body)
        } else {
            body.to_string()
        };
        let (content, truncated) = truncate_chars(&text, self.max_chars);
        Ok(json!({
            "url": url.as_str(),
            "content": content,
            "truncated": truncated,
        }))
    }
}

fn sniff_html(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(64).collect::<String>().to_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

fn html_to_text(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), 100) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => match Regex::new(r"(?s)<[^>]*>") {
            Ok(tags) => tags.replace_all(html, " ").split_whitespace().collect::<Vec<_>>().join(" "),
            Err(_) => html.to_string(),
        },
    }
}

fn truncate_chars(text: &str, max: usize) -> (String, bool) {
    match text.char_indices().nth(max) {
        Some((cut, _)) => (format!("{}\n...[truncated]", &text[..cut]), true),
        None => (text.to_string(), false),
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch a documentation page over HTTP(S) from an allowlisted domain and return it as plain text."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Absolute http(s) URL"}
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String> {
        let raw = args
            .get("url")
            .and_then(Value::as_str)
            .ok_or("Missing required parameter: url")?;
        let url = self.allowlist.permit(raw)?;
        tracing::info!(url = %url, "fetch_url tool execute");
        tokio::select! {
            res = self.get_text(url) => res,
            _ = ctx.cancel.cancelled() => Err("cancelled by user".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowlist_matches_host_and_subdomains() {
        let list = DomainAllowlist::new(vec!["docs.rs".into(), "*.github.com".into()]);
        assert!(list.permit("https://docs.rs/tokio").is_ok());
        assert!(list.permit("https://WWW.Docs.rs/serde").is_ok());
        assert!(list.permit("https://api.github.com/repos").is_ok());
        assert!(list.permit("https://notdocs.rs/x").is_err());
        assert!(list.permit("https://evil.example/docs.rs").is_err());
        assert!(list.permit("ftp://docs.rs/file").unwrap_err().contains("scheme"));
        assert!(list.permit("not a url").is_err());
    }

    #[test]
    fn test_html_to_text_and_truncation() {
        assert!(sniff_html("  <!DOCTYPE html><html></html>"));
        assert!(!sniff_html("{\"json\": true}"));
        let text = html_to_text("<html><body><p>Hello <b>world</b></p></body></html>");
        assert!(text.contains("Hello"));
        assert!(text.contains("world"));
        assert_eq!(truncate_chars("abcdef", 3), ("abc\n...[truncated]".to_string(), true));
        assert_eq!(truncate_chars("abc", 3), ("abc".to_string(), false));
    }

    #[tokio::test]
    async fn test_client_build_failure_is_reported() {
        let tool = FetchUrlTool {
            client: build_client(1, "bad\nagent"),
            allowlist: DomainAllowlist::new(vec!["docs.rs".into()]),
            max_chars: 100,
        };
        let err = tool
            .execute(json!({"url": "https://docs.rs/tokio"}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(err.contains("HTTP client"));
    }

    #[tokio::test]
    async fn test_rejects_before_network() {
        let tool = FetchUrlTool::new(vec!["docs.rs".into()], 1, 100);
        let err = tool
            .execute(json!({"url": "https://example.com"}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(err.contains("allowlist"));
    }
}
