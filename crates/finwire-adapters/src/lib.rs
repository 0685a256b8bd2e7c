//! Source adapter contract + markup extraction for listing and detail pages.

use std::collections::HashSet;

use finwire_core::{ArticleDetail, ArticleStub, UNKNOWN_PUBLISH_INFO};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "finwire-adapters";

/// Entry containers tried in order on a listing page; earlier = more specific.
pub const LISTING_ENTRY_SELECTORS: &[&str] = &[
    "#newsListContent li",
    "ul.news_list li",
    ".list-content li",
    ".repeatList li",
    "div.list li",
];

/// Body containers tried in order on a detail page; first one with enough text wins.
pub const CONTENT_SELECTORS: &[&str] = &[
    "#ContentBody",
    ".txtinfos",
    ".article-body",
    ".newsContent",
    "article",
    ".content",
];

/// Looser source-label containers, consulted when no `.item` carries the marker.
pub const SOURCE_LABEL_SELECTORS: &[&str] = &[".source", ".em_media", ".article-source"];

pub const STRIPPED_ELEMENTS: &str = "script, style, nav, footer, aside";

pub const SEE_MORE_MARKER: &str = "查看更多";
pub const AD_MARKER: &str = "广告";
pub const SOURCE_MARKER: &str = "来源：";

const MIN_TITLE_CHARS: usize = 5;
const MIN_CONTENT_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Regex(#[from] regex::Error),
}

/// Static facts about one configured listing source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceProfile {
    pub source_id: String,
    pub origin: String,
    pub source_label: String,
    pub category: String,
}

pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Never fails: a page without recognizable entries yields no stubs.
    fn parse_listing(&self, html: &str) -> Vec<ArticleStub>;

    fn extract_detail(&self, html: &str) -> ArticleDetail;
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn compile_all(selectors: &[&str]) -> Result<Vec<Selector>, AdapterError> {
    selectors.iter().map(|s| compile(s)).collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Text of an element with each text node trimmed and blank nodes dropped.
fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolve scheme-relative and root-relative hrefs; anything else passes through.
pub fn normalize_url(href: &str, origin: &str) -> String {
    let href = href.trim();
    if href.starts_with("//") {
        format!("https:{href}")
    } else if href.starts_with('/') {
        format!("{}{}", origin.trim_end_matches('/'), href)
    } else {
        href.to_string()
    }
}

fn keep_candidate(url: &str, title: &str) -> bool {
    url.contains("http")
        && title.chars().count() > MIN_TITLE_CHARS
        && !title.starts_with(SEE_MORE_MARKER)
        && !title.contains(AD_MARKER)
}

#[derive(Debug, Clone)]
pub struct ListingParser {
    origin: String,
    source_label: String,
    category: String,
    entries: Vec<Selector>,
    anchor: Selector,
}

impl ListingParser {
    pub fn new(profile: &SourceProfile) -> Result<Self, AdapterError> {
        Self::with_selectors(profile, LISTING_ENTRY_SELECTORS)
    }

    pub fn with_selectors(profile: &SourceProfile, entries: &[&str]) -> Result<Self, AdapterError> {
        Ok(Self {
            origin: profile.origin.clone(),
            source_label: profile.source_label.clone(),
            category: profile.category.clone(),
            entries: compile_all(entries)?,
            anchor: compile("a[href]")?,
        })
    }

    pub fn parse(&self, html: &str) -> Vec<ArticleStub> {
        let document = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut stubs = Vec::new();

        for (idx, entry_selector) in self.entries.iter().enumerate() {
            let before = stubs.len();
            for entry in document.select(entry_selector) {
                let Some(anchor) = entry.select(&self.anchor).next() else {
                    continue;
                };
                let Some(href) = anchor.value().attr("href") else {
                    continue;
                };
                let mut title = collapse_whitespace(&anchor.text().collect::<String>());
                if title.is_empty() {
                    title = anchor
                        .value()
                        .attr("title")
                        .map(collapse_whitespace)
                        .unwrap_or_default();
                }
                let url = normalize_url(href, &self.origin);
                if !keep_candidate(&url, &title) {
                    continue;
                }
                if !seen.insert(url.clone()) {
                    continue;
                }
                stubs.push(ArticleStub {
                    title,
                    url,
                    source: self.source_label.clone(),
                    category: self.category.clone(),
                });
            }
            debug!(strategy = idx, added = stubs.len() - before, "listing strategy applied");
        }

        stubs
    }
}

#[derive(Debug, Clone)]
pub struct DetailExtractor {
    stripped: Selector,
    content: Vec<Selector>,
    classed: Selector,
    source_labels: Vec<Selector>,
    item_class: Regex,
    datetime: Regex,
}

impl DetailExtractor {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            stripped: compile(STRIPPED_ELEMENTS)?,
            content: compile_all(CONTENT_SELECTORS)?,
            classed: compile("[class]")?,
            source_labels: compile_all(SOURCE_LABEL_SELECTORS)?,
            item_class: Regex::new(r"\bitem\b")?,
            datetime: Regex::new(r"[0-9]{4}年[0-9]{2}月[0-9]{2}日\s+[0-9]{2}:[0-9]{2}")?,
        })
    }

    pub fn extract(&self, html: &str) -> ArticleDetail {
        let mut document = Html::parse_document(html);
        self.strip_non_content(&mut document);

        let content = self.body_text(&document).unwrap_or_default();
        let timestamp = self.timestamp(&document);
        let source_label = self.source_label(&document);

        let publish_info = match (timestamp, source_label) {
            (Some(ts), Some(label)) => format!("{ts} {label}"),
            (Some(ts), None) => ts,
            (None, Some(label)) => label,
            (None, None) => UNKNOWN_PUBLISH_INFO.to_string(),
        };

        ArticleDetail {
            content,
            publish_info,
        }
    }

    fn strip_non_content(&self, document: &mut Html) {
        let ids = document
            .select(&self.stripped)
            .map(|el| el.id())
            .collect::<Vec<_>>();
        for id in ids {
            if let Some(mut node) = document.tree.get_mut(id) {
                node.detach();
            }
        }
    }

    fn body_text(&self, document: &Html) -> Option<String> {
        self.content.iter().find_map(|selector| {
            document
                .select(selector)
                .map(element_text)
                .find(|text| text.chars().count() > MIN_CONTENT_CHARS)
        })
    }

    fn timestamp(&self, document: &Html) -> Option<String> {
        let first_item = document.select(&self.classed).find(|el| {
            el.value()
                .attr("class")
                .is_some_and(|class| self.item_class.is_match(class))
        })?;
        let text = first_item.text().collect::<String>();
        self.datetime.find(&text).map(|m| m.as_str().to_string())
    }

    fn source_label(&self, document: &Html) -> Option<String> {
        let exact = document.select(&self.classed).find_map(|el| {
            if el.value().attr("class").map(str::trim) != Some("item") {
                return None;
            }
            let text = collapse_whitespace(&el.text().collect::<String>());
            text.contains(SOURCE_MARKER).then_some(text)
        });
        if exact.is_some() {
            return exact;
        }

        self.source_labels.iter().find_map(|selector| {
            document
                .select(selector)
                .map(|el| collapse_whitespace(&el.text().collect::<String>()))
                .find(|text| !text.is_empty())
                .map(|text| {
                    if text.contains(SOURCE_MARKER) {
                        text
                    } else {
                        format!("{SOURCE_MARKER}{text}")
                    }
                })
        })
    }
}

/// Adapter for finance.eastmoney.com listing and article pages.
#[derive(Debug, Clone)]
pub struct EastmoneyAdapter {
    source_id: String,
    listing: ListingParser,
    detail: DetailExtractor,
}

impl EastmoneyAdapter {
    pub fn new(profile: &SourceProfile) -> Result<Self, AdapterError> {
        Ok(Self {
            source_id: profile.source_id.clone(),
            listing: ListingParser::new(profile)?,
            detail: DetailExtractor::new()?,
        })
    }
}

impl SourceAdapter for EastmoneyAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn parse_listing(&self, html: &str) -> Vec<ArticleStub> {
        self.listing.parse(html)
    }

    fn extract_detail(&self, html: &str) -> ArticleDetail {
        self.detail.extract(html)
    }
}

pub fn eastmoney_profile() -> SourceProfile {
    SourceProfile {
        source_id: "eastmoney".to_string(),
        origin: "https://finance.eastmoney.com".to_string(),
        source_label: "东方财富".to_string(),
        category: "财经".to_string(),
    }
}

pub fn adapter_for_source(
    profile: &SourceProfile,
) -> Result<Option<Box<dyn SourceAdapter>>, AdapterError> {
    match profile.source_id.as_str() {
        "eastmoney" => Ok(Some(Box::new(EastmoneyAdapter::new(profile)?))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(name: &str) -> String {
        let path = workspace_root().join("fixtures/eastmoney").join(name);
        fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn adapter() -> EastmoneyAdapter {
        EastmoneyAdapter::new(&eastmoney_profile()).unwrap()
    }

    #[test]
    fn normalizes_scheme_and_root_relative_urls() {
        assert_eq!(normalize_url("//a/b", "https://x.com"), "https://a/b");
        assert_eq!(normalize_url("/a/b", "https://x.com"), "https://x.com/a/b");
        assert_eq!(normalize_url("/a/b", "https://x.com/"), "https://x.com/a/b");
        assert_eq!(normalize_url("https://a/b", "https://x.com"), "https://a/b");
        assert_eq!(normalize_url("a/b.html", "https://x.com"), "a/b.html");
    }

    #[test]
    fn listing_keeps_valid_anchor_and_drops_short_title() {
        let html = r#"
            <ul id="newsListContent">
              <li><p class="title"><a href="/finance/1.html">Markets rally on rate cut news</a></p></li>
              <li><p class="title"><a href="/finance/2.html">ad</a></p></li>
            </ul>
        "#;
        let stubs = adapter().parse_listing(html);
        assert_eq!(stubs.len(), 1);
        assert_eq!(stubs[0].url, "https://finance.eastmoney.com/finance/1.html");
        assert_eq!(stubs[0].title, "Markets rally on rate cut news");
        assert_eq!(stubs[0].source, "东方财富");
        assert_eq!(stubs[0].category, "财经");
    }

    #[test]
    fn listing_without_matching_containers_is_empty() {
        assert!(adapter().parse_listing("").is_empty());
        assert!(adapter()
            .parse_listing("<html><body><div><a href='/x.html'>沪深两市成交额突破万亿</a></div></body></html>")
            .is_empty());
    }

    #[test]
    fn listing_dedupes_by_url_in_first_seen_order() {
        let html = r#"
            <div class="list">
              <ul class="news_list">
                <li><a href="https://finance.eastmoney.com/a/1.html">第一条新闻标题很长</a></li>
                <li><a href="//finance.eastmoney.com/a/2.html">第二条新闻标题很长</a></li>
                <li><a href="/a/1.html">重复链接不同标题</a></li>
              </ul>
            </div>
        "#;
        let stubs = adapter().parse_listing(html);
        let urls = stubs.iter().map(|s| s.url.as_str()).collect::<Vec<_>>();
        assert_eq!(
            urls,
            vec![
                "https://finance.eastmoney.com/a/1.html",
                "https://finance.eastmoney.com/a/2.html",
            ]
        );
        assert_eq!(stubs[0].title, "第一条新闻标题很长");
    }

    #[test]
    fn listing_filters_see_more_and_ad_entries() {
        let html = r#"
            <ul id="newsListContent">
              <li><a href="/a/more.html">查看更多财经要闻内容</a></li>
              <li><a href="/a/ad.html">本周理财特惠广告专区</a></li>
              <li><a href="javascript:void(0)">不是一个可用的链接</a></li>
              <li><a href="/a/ok.html">人民币汇率小幅走强</a></li>
            </ul>
        "#;
        let stubs = adapter().parse_listing(html);
        assert_eq!(stubs.len(), 1);
        assert_eq!(stubs[0].url, "https://finance.eastmoney.com/a/ok.html");
    }

    #[test]
    fn listing_fixture_yields_expected_stubs() {
        let stubs = adapter().parse_listing(&fixture("listing.html"));
        assert_eq!(stubs.len(), 3);
        assert!(stubs.iter().all(|s| s.url.starts_with("https://")));
        assert_eq!(
            stubs[0].url,
            "https://finance.eastmoney.com/a/202602113640000001.html"
        );
    }

    #[test]
    fn detail_recovers_timestamp_and_source() {
        let detail = adapter().extract_detail(&fixture("detail.html"));
        assert_eq!(detail.publish_info, "2026年02月11日 13:25 来源：证券时报");
        assert!(detail.content.chars().count() > MIN_CONTENT_CHARS);
        assert!(detail.content.starts_with("2月11日"));
        assert!(!detail.content.contains("trackPageView"));
        assert!(!detail.content.contains("相关阅读"));
    }

    #[test]
    fn timestamp_is_cut_out_of_surrounding_text() {
        let html = r#"<div class="item">发布于 2026年02月11日 13:25 · 阅读 3021</div>"#;
        let detail = adapter().extract_detail(html);
        assert_eq!(detail.publish_info, "2026年02月11日 13:25");
    }

    #[test]
    fn timestamp_requires_ascii_digits_and_separating_space() {
        let glued = adapter().extract_detail(r#"<div class="item">2026年02月11日13:25</div>"#);
        assert_eq!(glued.publish_info, UNKNOWN_PUBLISH_INFO);

        let fullwidth =
            adapter().extract_detail(r#"<div class="item">２０２６年０２月１１日 １３:２５</div>"#);
        assert_eq!(fullwidth.publish_info, UNKNOWN_PUBLISH_INFO);
    }

    #[test]
    fn composite_class_names_do_not_count_as_item() {
        let html = r#"<div class="news_item">2026年02月11日 13:25</div>"#;
        let detail = adapter().extract_detail(html);
        assert_eq!(detail.publish_info, UNKNOWN_PUBLISH_INFO);
    }

    #[test]
    fn missing_time_and_source_yields_sentinel() {
        let html = "<html><body><h1>标题</h1><p>短文</p></body></html>";
        let detail = adapter().extract_detail(html);
        assert_eq!(detail.publish_info, UNKNOWN_PUBLISH_INFO);
        assert!(detail.content.is_empty());
    }

    #[test]
    fn source_only_and_loose_source_gets_marker() {
        let exact = r#"<div class="item">来源：上海证券报</div>"#;
        assert_eq!(adapter().extract_detail(exact).publish_info, "来源：上海证券报");

        let loose = r#"<div class="item">2026年02月11日 09:30</div><span class="source">中国证券报</span>"#;
        assert_eq!(
            adapter().extract_detail(loose).publish_info,
            "2026年02月11日 09:30 来源：中国证券报"
        );
    }

    #[test]
    fn content_selector_priority_and_length_threshold() {
        let long = "沪指".repeat(60);
        let html = format!(
            r#"<div class="content">{long}</div><div id="ContentBody"><p>太短</p></div>"#
        );
        let detail = adapter().extract_detail(&html);
        assert_eq!(detail.content, long);

        let both = format!(
            r#"<div class="content">内容容器{long}</div><div id="ContentBody"><p>{long}</p></div>"#
        );
        assert_eq!(adapter().extract_detail(&both).content, long);
    }

    #[test]
    fn unknown_source_has_no_adapter() {
        let mut profile = eastmoney_profile();
        profile.source_id = "sina".to_string();
        assert!(adapter_for_source(&profile).unwrap().is_none());
        assert!(adapter_for_source(&eastmoney_profile()).unwrap().is_some());
    }
}
