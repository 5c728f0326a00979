//! Page parsing seam plus a minimal meta-tag implementation.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

use crate::types::{ExtensionId, ExtensionRecord};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(pub String);

/// Turns store pages into structured data. The field-extraction rules are
/// owned by the implementation; the executor only sees the outcome.
pub trait ExtensionPageParser: Send + Sync {
    fn parse_extension(
        &self,
        id: &ExtensionId,
        html: &str,
    ) -> Result<ExtensionRecord, ParseError>;

    /// Extension identifiers linked from a listing page, in page order.
    fn parse_listing(&self, html: &str) -> Vec<ExtensionId> {
        extract_extension_ids(html)
    }
}

static DETAIL_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"/detail/(?:[^/"'?#\s]+/)?([a-p]{32})"#)
        .expect("detail link pattern must compile")
});

static META_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"<meta\s+(?:property|name|itemprop)="([^"]+)"\s+content="([^"]*)"\s*/?>"#,
    )
    .expect("meta tag pattern must compile")
});

static USER_COUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([\d,.\x{a0}]+)\+?\s+users")
        .expect("user count pattern must compile")
});

static RATING_COUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([\d,.]+)\s+ratings").expect("rating count pattern must compile")
});

/// Distinct extension ids linked via `/detail/...` URLs, first occurrence
/// first.
pub fn extract_extension_ids(html: &str) -> Vec<ExtensionId> {
    let mut seen = HashSet::new();
    DETAIL_LINK
        .captures_iter(html)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|id| seen.insert(*id))
        .filter_map(|id| ExtensionId::new(id).ok())
        .collect()
}

/// Reads listing fields from `<meta>` tags and the "N users" / "N ratings"
/// labels. Good enough to keep the pipeline moving; richer parsers plug in
/// through [`ExtensionPageParser`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MetaTagParser;

impl MetaTagParser {
    fn meta<'a>(html: &'a str, key: &str) -> Option<&'a str> {
        META_TAG
            .captures_iter(html)
            .find(|caps| caps.get(1).is_some_and(|m| m.as_str() == key))
            .and_then(|caps| caps.get(2))
            .map(|m| m.as_str().trim())
            .filter(|value| !value.is_empty())
    }
}

fn parse_count(raw: &str) -> Option<u64> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn decode_entities(raw: &str) -> String {
    raw.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

impl ExtensionPageParser for MetaTagParser {
    fn parse_extension(
        &self,
        id: &ExtensionId,
        html: &str,
    ) -> Result<ExtensionRecord, ParseError> {
        let name = Self::meta(html, "og:title")
            .map(|title| {
                decode_entities(title.trim_end_matches(" - Chrome Web Store"))
            })
            .ok_or_else(|| ParseError(format!("no title found for {id}")))?;

        let user_count = USER_COUNT
            .captures(html)
            .and_then(|caps| caps.get(1))
            .and_then(|m| parse_count(m.as_str()))
            .ok_or_else(|| ParseError(format!("no user count found for {id}")))?;

        let mut record = ExtensionRecord::new(id.clone(), name, user_count);
        record.rating = Self::meta(html, "ratingValue").and_then(|v| v.parse().ok());
        record.review_count = RATING_COUNT
            .captures(html)
            .and_then(|caps| caps.get(1))
            .and_then(|m| parse_count(m.as_str()));
        record.developer = Self::meta(html, "author").map(decode_entities);
        record.category = Self::meta(html, "category").map(decode_entities);
        record.version = Self::meta(html, "version").map(str::to_string);
        record.keywords = Self::meta(html, "keywords")
            .map(|raw| {
                raw.split(',')
                    .map(|k| decode_entities(k.trim()))
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        record.scraped_at = Utc::now();

        Ok(record)
    }
}
