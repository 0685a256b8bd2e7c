//! Core article model, record builder, and feed projection for finwire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "finwire-core";

/// Stored content is cut to this many characters.
pub const MAX_CONTENT_CHARS: usize = 5000;
/// Summaries keep at most this many characters before the ellipsis.
pub const MAX_SUMMARY_CHARS: usize = 200;
pub const SUMMARY_ELLIPSIS: &str = "...";
/// Summary used when a detail page yielded no body text.
pub const NO_SUMMARY: &str = "暂无摘要";
/// Publish info used when neither a timestamp nor a source label was found.
pub const UNKNOWN_PUBLISH_INFO: &str = "未知时间/来源";
/// Upper bound (exclusive) of derived article ids.
pub const ARTICLE_ID_MODULUS: u64 = 100_000;

/// Partial article taken from a listing page, pending detail enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleStub {
    pub title: String,
    pub url: String,
    pub source: String,
    pub category: String,
}

/// Fields recovered from a detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleDetail {
    pub content: String,
    pub publish_info: String,
}

impl ArticleDetail {
    pub fn unknown() -> Self {
        Self {
            content: String::new(),
            publish_info: UNKNOWN_PUBLISH_INFO.to_string(),
        }
    }
}

/// Unit of persistence. `url` is the natural key; `id` is a convenience fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub source: String,
    pub category: String,
    pub publish_time: String,
    pub content: String,
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ArticleRecord {
    /// Merge a listing stub with its detail fields.
    pub fn build(stub: ArticleStub, detail: ArticleDetail) -> Self {
        let content = truncate_chars(detail.content.trim(), MAX_CONTENT_CHARS);
        let summary = summarize(&content);
        Self {
            id: article_id(&stub.url),
            title: stub.title,
            url: stub.url,
            source: stub.source,
            category: stub.category,
            publish_time: detail.publish_info,
            content,
            summary,
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// A record as read back from the store, with its insert timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArticle {
    pub row_id: i64,
    pub record: ArticleRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Public feed shape; content and tags are intentionally left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub source: String,
    pub publish_time: String,
    pub summary: String,
}

impl From<&ArticleRecord> for FeedItem {
    fn from(record: &ArticleRecord) -> Self {
        Self {
            id: record.id,
            title: record.title.clone(),
            url: record.url.clone(),
            source: record.source.clone(),
            publish_time: record.publish_time.clone(),
            summary: record.summary.clone(),
        }
    }
}

/// Deterministic id: the first 8 bytes of SHA-256(url) reduced into `0..ARTICLE_ID_MODULUS`.
pub fn article_id(url: &str) -> i64 {
    let digest = Sha256::digest(url.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % ARTICLE_ID_MODULUS) as i64
}

pub fn summarize(content: &str) -> String {
    if content.is_empty() {
        return NO_SUMMARY.to_string();
    }
    if content.chars().count() > MAX_SUMMARY_CHARS {
        let mut summary = truncate_chars(content, MAX_SUMMARY_CHARS);
        summary.push_str(SUMMARY_ELLIPSIS);
        summary
    } else {
        content.to_string()
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
