//! Notion sink: each saved note becomes a child page of a configured page.
//!
//! Notion limits a single rich-text run to 2000 characters and a create
//! request to 100 child blocks, so long paragraphs and code are split into
//! several blocks and the block list is capped.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use scribe_core::{domain::UserId, errors::Error, ports::NoteSink, Result};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client;

const PAGES_URL: &str = "https://api.notion.com/v1/pages";
const NOTION_VERSION: &str = "2022-06-28";
const MAX_RICH: usize = 1900;
const MAX_TITLE: usize = 180;
const MAX_BLOCKS: usize = 100;
const POST_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug)]
pub struct NotionClient {
    api_key: String,
    page_id: String,
    http: reqwest::Client,
    retry_base: Duration,
}

impl NotionClient {
    pub fn new(api_key: impl Into<String>, page_id: impl Into<String>) -> Result<Self> {
        Ok(Self {
            api_key: api_key.into(),
            page_id: page_id.into(),
            http: client::build("notion", Duration::from_secs(30))?,
            retry_base: Duration::from_secs(1),
        })
    }

    /// 5xx and transport errors are retried with a doubling pause; 4xx fail at once.
    async fn post_with_retry(&self, key: &str, body: &Value) -> Result<Value> {
        let mut attempt = 1;
        loop {
            let sent = self
                .http
                .post(PAGES_URL)
                .bearer_auth(key)
                .header("Notion-Version", NOTION_VERSION)
                .json(body)
                .send()
                .await;

            let err = match sent {
                Ok(resp) if resp.status().is_client_error() => {
                    return Err(client::ensure_success("notion", resp)
                        .await
                        .err()
                        .unwrap_or_else(|| Error::External("notion rejected the page".into())));
                }
                Ok(resp) => match client::ensure_success("notion", resp).await {
                    Ok(resp) => {
                        return resp
                            .json()
                            .await
                            .map_err(|e| Error::External(format!("notion json error: {e}")));
                    }
                    Err(e) => e,
                },
                Err(e) => Error::External(format!("notion request error: {e}")),
            };

            if attempt >= POST_ATTEMPTS {
                return Err(err);
            }
            let wait = self.retry_base * 2u32.pow(attempt);
            warn!(attempt, wait_ms = wait.as_millis() as u64, "notion request failed: {err}");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl NoteSink for NotionClient {
    async fn save(&self, text: &str, user_id: UserId) -> Result<()> {
        let key = client::require("notion", "NOTION_API_KEY", &self.api_key)?;
        let page_id = client::require("notion", "NOTION_PAGE_ID", &self.page_id)?;

        let body = page_body(page_id, text, &Local::now().format("%Y-%m-%d %H:%M").to_string());
        let created = self.post_with_retry(key, &body).await?;

        info!(
            user_id = %user_id,
            page = created.get("id").and_then(serde_json::Value::as_str).unwrap_or("?"),
            "saved to notion"
        );
        Ok(())
    }
}

fn page_body(parent: &str, text: &str, now: &str) -> Value {
    let md = strip_fence(text);
    let title = extract_title(&md).unwrap_or_else(|| format!("Note {now}"));

    let mut children = paragraph_blocks(&format!("Saved at {now}"));
    children.extend(markdown_to_blocks(&md));
    let children = cap_blocks(children);

    json!({
        "parent": { "page_id": parent },
        "properties": {
            "title": { "title": [{ "text": { "content": title } }] },
        },
        "children": children,
    })
}

/// Unwraps output that arrived inside a single ```` ``` ```` fence.
pub fn strip_fence(text: &str) -> String {
    let t = text.trim();
    if t.len() < 6 || !t.starts_with("```") || !t.ends_with("```") {
        return text.to_string();
    }
    let inner = &t[3..t.len() - 3];
    match inner.split_once('\n') {
        // Drop the language tag on the opening line.
        Some((_, rest)) => rest.trim().to_string(),
        None => inner.trim().to_string(),
    }
}

/// First markdown heading, without its `#` markers.
pub fn extract_title(md: &str) -> Option<String> {
    let line = md.lines().find(|l| l.starts_with('#'))?;
    let title = line.trim_start_matches('#').trim();
    if title.is_empty() {
        return None;
    }
    Some(title.chars().take(MAX_TITLE).collect())
}

fn chunk_chars(text: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(max).map(|c| c.iter().collect()).collect()
}

fn rich_text(content: &str) -> Value {
    json!([{ "type": "text", "text": { "content": content } }])
}

fn block(kind: &str, inner: Value) -> Value {
    let mut b = json!({ "object": "block", "type": kind });
    b[kind] = inner;
    b
}

fn heading(level: u8, text: &str) -> Value {
    let kind = format!("heading_{level}");
    let content: String = text.chars().take(MAX_RICH).collect();
    block(&kind, json!({ "rich_text": rich_text(&content) }))
}

fn paragraph_blocks(text: &str) -> Vec<Value> {
    chunk_chars(text, MAX_RICH)
        .iter()
        .map(|c| block("paragraph", json!({ "rich_text": rich_text(c) })))
        .collect()
}

fn code_blocks(code: &str, language: &str) -> Vec<Value> {
    chunk_chars(code, MAX_RICH)
        .iter()
        .map(|c| block("code", json!({ "language": language, "rich_text": rich_text(c) })))
        .collect()
}

pub fn markdown_to_blocks(md: &str) -> Vec<Value> {
    let mut blocks = Vec::new();
    let mut code: Option<(String, Vec<&str>)> = None;

    for line in md.lines() {
        if let Some(fence) = line.trim().strip_prefix("```") {
            match code.take() {
                Some((lang, buf)) => blocks.extend(code_blocks(&buf.join("\n"), &lang)),
                None => {
                    let lang = fence.trim().to_lowercase();
                    let lang = if lang.is_empty() { "plain text".to_string() } else { lang };
                    code = Some((lang, Vec::new()));
                }
            }
            continue;
        }
        if let Some((_, buf)) = code.as_mut() {
            buf.push(line);
            continue;
        }

        if let Some(rest) = line.strip_prefix("### ") {
            blocks.push(heading(3, rest.trim_start()));
        } else if let Some(rest) = line.strip_prefix("## ") {
            blocks.push(heading(2, rest.trim_start()));
        } else if let Some(rest) = line.strip_prefix("# ") {
            blocks.push(heading(1, rest.trim_start()));
        } else if let Some(rest) = line.strip_prefix("- ") {
            for part in chunk_chars(rest.trim_start(), MAX_RICH) {
                blocks.push(block(
                    "bulleted_list_item",
                    json!({ "rich_text": rich_text(&part) }),
                ));
            }
        } else if line.trim().is_empty() {
            blocks.push(block("paragraph", json!({ "rich_text": [] })));
        } else {
            blocks.extend(paragraph_blocks(line));
        }
    }

    // Unterminated fence at end of input.
    if let Some((lang, buf)) = code {
        blocks.extend(code_blocks(&buf.join("\n"), &lang));
    }
    blocks
}

fn cap_blocks(mut blocks: Vec<Value>) -> Vec<Value> {
    if blocks.len() <= MAX_BLOCKS {
        return blocks;
    }
    let total = blocks.len();
    blocks.truncate(MAX_BLOCKS - 1);
    blocks.extend(paragraph_blocks(&format!(
        "Note truncated: showing the first {} of {total} blocks.",
        MAX_BLOCKS - 1
    )));
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(blocks: &[Value]) -> Vec<&str> {
        blocks.iter().map(|b| b["type"].as_str().unwrap()).collect()
    }

    #[test]
    fn fenced_output_is_unwrapped() {
        assert_eq!(strip_fence("```markdown\n# T\nbody\n```"), "# T\nbody");
        assert_eq!(strip_fence("```\n# T\n```"), "# T");
        assert_eq!(strip_fence("# T\n```rust\nx\n```"), "# T\n```rust\nx\n```");
    }

    #[test]
    fn title_from_first_heading() {
        assert_eq!(extract_title("intro\n## Sub\n# Main").as_deref(), Some("Sub"));
        assert_eq!(extract_title("no heading"), None);
        let long = format!("# {}", "x".repeat(300));
        assert_eq!(extract_title(&long).unwrap().chars().count(), MAX_TITLE);
    }

    #[test]
    fn markdown_maps_to_blocks() {
        let md = "# Title\n## Part\n### Small\n- item\n\nplain\n```Rust\nfn a() {}\n```";
        let blocks = markdown_to_blocks(md);
        assert_eq!(
            kinds(&blocks),
            vec![
                "heading_1",
                "heading_2",
                "heading_3",
                "bulleted_list_item",
                "paragraph",
                "paragraph",
                "code"
            ]
        );
        assert_eq!(blocks[0]["heading_1"]["rich_text"][0]["text"]["content"], "Title");
        assert_eq!(blocks[6]["code"]["language"], "rust");
        assert_eq!(blocks[6]["code"]["rich_text"][0]["text"]["content"], "fn a() {}");
    }

    #[test]
    fn long_paragraphs_are_chunked() {
        let line = "é".repeat(MAX_RICH * 2 + 5);
        let blocks = markdown_to_blocks(&line);
        assert_eq!(blocks.len(), 3);
        for b in &blocks {
            let content = b["paragraph"]["rich_text"][0]["text"]["content"].as_str().unwrap();
            assert!(content.chars().count() <= MAX_RICH);
        }
    }

    #[test]
    fn unterminated_code_is_flushed() {
        let blocks = markdown_to_blocks("```\nlet x = 1;");
        assert_eq!(kinds(&blocks), vec!["code"]);
        assert_eq!(blocks[0]["code"]["language"], "plain text");
    }

    #[test]
    fn page_body_caps_children() {
        let md = (0..150).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let body = page_body("parent", &format!("# Heading\n{md}"), "2024-01-01 10:00");
        let children = body["children"].as_array().unwrap();
        assert_eq!(children.len(), MAX_BLOCKS);
        assert_eq!(body["parent"]["page_id"], "parent");
        assert_eq!(
            body["properties"]["title"]["title"][0]["text"]["content"],
            "Heading"
        );
        let last = children[MAX_BLOCKS - 1]["paragraph"]["rich_text"][0]["text"]["content"]
            .as_str()
            .unwrap();
        assert!(last.starts_with("Note truncated"), "{last}");
    }

    #[test]
    fn untitled_notes_get_a_timestamped_title() {
        let body = page_body("p", "just text", "2024-01-01 10:00");
        assert_eq!(
            body["properties"]["title"]["title"][0]["text"]["content"],
            "Note 2024-01-01 10:00"
        );
    }
}
