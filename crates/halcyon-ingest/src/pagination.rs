//! Page decoding and next-page detection
//!
//! The vendor API is not consistent about how list endpoints paginate. In
//! `auto` mode the response body is probed in this order:
//!
//! 1. absolute next-page URL (`next`, `links.next`, `paging.next`,
//!    `_links.next.href`)
//! 2. continuation token (`cursor`, `nextCursor`, ... or the same in `paging`)
//! 3. page metadata block with current page and total pages
//! 4. offset, when the body reports a `total`/`count` and the page was full
//!
//! A body with none of these is the last page.

use crate::object_types::PaginationStyle;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// One API object as returned, before normalization.
pub type RawRecord = Map<String, Value>;

/// Position of the next page to request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PageCursor {
    /// Follow this absolute URL verbatim
    Url(String),
    /// Send as the cursor query parameters
    Token(String),
    /// 1-based page number
    Page(u64),
    Offset(u64),
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageCursor::Url(url) => write!(f, "url:{url}"),
            PageCursor::Token(token) => write!(f, "cursor:{token}"),
            PageCursor::Page(page) => write!(f, "page:{page}"),
            PageCursor::Offset(offset) => write!(f, "offset:{offset}"),
        }
    }
}

/// One decoded response.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Records in API order
    pub records: Vec<RawRecord>,
    pub next_cursor: Option<PageCursor>,
    /// Wall time of the request, retries included
    pub latency: Duration,
}

const NEXT_LINK_PATHS: &[&[&str]] = &[
    &["next"],
    &["links", "next"],
    &["paging", "next"],
    &["_links", "next", "href"],
];

const CURSOR_KEYS: &[&str] = &[
    "cursor",
    "nextCursor",
    "next_cursor",
    "continuationToken",
    "continuation_token",
];

const NESTED_CURSOR_KEYS: &[&str] = &["cursor", "nextCursor", "next_cursor"];

const PAGE_BLOCKS: &[&str] = &["page", "pagination", "paging", "meta"];

fn objects(items: Vec<Value>) -> Vec<RawRecord> {
    items
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

/// Split a response body into its records and the cursor of the next page.
///
/// Records come from a bare array, from an array under the first matching
/// `list_keys` entry, or the body itself as a single object. Array entries
/// that are not objects are dropped.
pub fn decode_page(
    style: PaginationStyle,
    payload: Value,
    list_keys: &[&str],
    current: Option<&PageCursor>,
    page_size: u32,
) -> (Vec<RawRecord>, Option<PageCursor>) {
    match payload {
        Value::Array(items) => {
            let records = objects(items);
            let next = next_cursor(style, &Value::Null, current, records.len(), page_size);
            (records, next)
        },
        Value::Object(mut map) => {
            let key = list_keys
                .iter()
                .find(|k| matches!(map.get(**k), Some(Value::Array(_))));
            let items = key.and_then(|k| map.remove(*k));
            let envelope = Value::Object(map);

            if let Some(Value::Array(items)) = items {
                let records = objects(items);
                let next = next_cursor(style, &envelope, current, records.len(), page_size);
                return (records, next);
            }

            let next = next_cursor(style, &envelope, current, 1, page_size);
            match envelope {
                Value::Object(single) => (vec![single], next),
                _ => (Vec::new(), next),
            }
        },
        _ => (Vec::new(), None),
    }
}

/// Work out where the page after `current` lives.
///
/// `record_count` is the number of records on the page just decoded and
/// `page_size` the size that was requested.
pub fn next_cursor(
    style: PaginationStyle,
    payload: &Value,
    current: Option<&PageCursor>,
    record_count: usize,
    page_size: u32,
) -> Option<PageCursor> {
    let full_page = record_count > 0 && record_count >= page_size as usize;

    match style {
        PaginationStyle::None => None,
        PaginationStyle::NextLink => next_link(payload).map(PageCursor::Url),
        PaginationStyle::Cursor => cursor_token(payload).map(PageCursor::Token),
        PaginationStyle::PageNumber => match page_meta(payload) {
            Some(meta) => next_page(meta),
            None if full_page => Some(PageCursor::Page(current_page(current) + 1)),
            None => None,
        },
        PaginationStyle::Offset => {
            full_page.then(|| PageCursor::Offset(current_offset(current) + u64::from(page_size)))
        },
        PaginationStyle::Auto => {
            if let Some(url) = next_link(payload) {
                return Some(PageCursor::Url(url));
            }
            if let Some(token) = cursor_token(payload) {
                return Some(PageCursor::Token(token));
            }
            if let Some(meta) = page_meta(payload) {
                return next_page(meta);
            }
            let has_total = payload
                .as_object()
                .is_some_and(|m| m.contains_key("total") || m.contains_key("count"));
            if has_total && full_page {
                return Some(PageCursor::Offset(
                    current_offset(current) + u64::from(page_size),
                ));
            }
            None
        },
    }
}

fn current_page(current: Option<&PageCursor>) -> u64 {
    match current {
        Some(PageCursor::Page(p)) => *p,
        _ => 1,
    }
}

fn current_offset(current: Option<&PageCursor>) -> u64 {
    match current {
        Some(PageCursor::Offset(o)) => *o,
        _ => 0,
    }
}

fn next_page((page, total): (u64, u64)) -> Option<PageCursor> {
    (page < total).then_some(PageCursor::Page(page + 1))
}

fn next_link(payload: &Value) -> Option<String> {
    NEXT_LINK_PATHS.iter().find_map(|path| {
        let value = path.iter().try_fold(payload, |cur, key| cur.get(key))?;
        value
            .as_str()
            .filter(|s| s.starts_with("http://") || s.starts_with("https://"))
            .map(str::to_string)
    })
}

fn non_blank(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        map.get(*k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn cursor_token(payload: &Value) -> Option<String> {
    let map = payload.as_object()?;
    non_blank(map, CURSOR_KEYS).or_else(|| {
        map.get("paging")
            .and_then(Value::as_object)
            .and_then(|paging| non_blank(paging, NESTED_CURSOR_KEYS))
    })
}

/// `(current page, total pages)` from the first metadata block that has both.
fn page_meta(payload: &Value) -> Option<(u64, u64)> {
    let map = payload.as_object()?;
    PAGE_BLOCKS.iter().find_map(|block| {
        let block = map.get(*block)?.as_object()?;
        let page = ["page", "currentPage", "current_page"]
            .iter()
            .find_map(|k| block.get(*k).and_then(Value::as_u64))?;
        let total = ["totalPages", "total_pages"]
            .iter()
            .find_map(|k| block.get(*k).and_then(Value::as_u64))
            .filter(|t| *t >= 1)?;
        Some((page, total))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::object_types::DEFAULT_LIST_KEYS;
    use serde_json::json;

    fn decode(payload: Value) -> (Vec<RawRecord>, Option<PageCursor>) {
        decode_page(PaginationStyle::Auto, payload, DEFAULT_LIST_KEYS, None, 10)
    }

    #[test]
    fn test_decode_page_shapes() {
        let (records, next) = decode(json!([{"id": 1}, 7, {"id": 2}]));
        assert_eq!(records.len(), 2);
        assert_eq!(next, None);

        let (records, next) = decode(json!({"data": [{"id": 1}], "cursor": "x"}));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["id"], json!(1));
        assert!(!records[0].contains_key("cursor"));
        assert_eq!(next, Some(PageCursor::Token("x".into())));

        let (records, _) = decode(json!({"status": "ok"}));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["status"], json!("ok"));

        assert!(decode(json!("nope")).0.is_empty());
    }

    #[test]
    fn test_auto_detection_order() {
        let link = json!({"links": {"next": "https://api/x?page=2"}, "cursor": "c"});
        assert_eq!(
            next_cursor(PaginationStyle::Auto, &link, None, 1, 10),
            Some(PageCursor::Url("https://api/x?page=2".into()))
        );

        let relative = json!({"next": "/v2/alerts?page=2", "nextCursor": " abc "});
        assert_eq!(
            next_cursor(PaginationStyle::Auto, &relative, None, 1, 10),
            Some(PageCursor::Token("abc".into()))
        );

        let nested = json!({"paging": {"next_cursor": "n1"}});
        assert_eq!(
            next_cursor(PaginationStyle::Auto, &nested, None, 0, 10),
            Some(PageCursor::Token("n1".into()))
        );

        let meta = json!({"meta": {"currentPage": 2, "totalPages": 3}});
        assert_eq!(
            next_cursor(PaginationStyle::Auto, &meta, None, 10, 10),
            Some(PageCursor::Page(3))
        );

        let last = json!({"pagination": {"page": 3, "total_pages": 3}});
        assert_eq!(next_cursor(PaginationStyle::Auto, &last, None, 10, 10), None);
    }

    #[test]
    fn test_auto_offset_heuristic() {
        let body = json!({"total": 25, "items": []});
        let first = next_cursor(PaginationStyle::Auto, &body, None, 10, 10);
        assert_eq!(first, Some(PageCursor::Offset(10)));

        let second = next_cursor(PaginationStyle::Auto, &body, first.as_ref(), 10, 10);
        assert_eq!(second, Some(PageCursor::Offset(20)));

        assert_eq!(
            next_cursor(PaginationStyle::Auto, &body, second.as_ref(), 5, 10),
            None
        );
    }

    #[test]
    fn test_blank_cursor_ends_pagination() {
        let body = json!({"items": [], "cursor": "   "});
        assert_eq!(next_cursor(PaginationStyle::Auto, &body, None, 0, 10), None);
        assert_eq!(
            next_cursor(PaginationStyle::Cursor, &json!({"cursor": null}), None, 3, 10),
            None
        );
    }

    #[test]
    fn test_explicit_styles() {
        let body = json!({"items": [], "cursor": "c"});
        assert_eq!(next_cursor(PaginationStyle::None, &body, None, 10, 10), None);
        assert_eq!(next_cursor(PaginationStyle::NextLink, &body, None, 10, 10), None);

        let page2 = next_cursor(PaginationStyle::PageNumber, &json!({}), None, 10, 10);
        assert_eq!(page2, Some(PageCursor::Page(2)));
        assert_eq!(
            next_cursor(PaginationStyle::PageNumber, &json!({}), page2.as_ref(), 9, 10),
            None
        );

        assert_eq!(
            next_cursor(PaginationStyle::Offset, &json!([]), None, 10, 10),
            Some(PageCursor::Offset(10))
        );
    }
}
