//! Pagination disciplines driven against an [`ApiClient`].
//!
//! - link-following (RFC 5988 `Link` header, a next-page URL in the body, or
//!   a continuation token in the body), bounded by a max-pages cap;
//! - time-windowed, advancing the window start past the last seen timestamp;
//! - index-based (`startIndex`/`offset` + page size).

use std::future::Future;

use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::error::{json_shape, ConnectorError, ErrorContext};
use crate::http_client::{append_query, HttpRequest};
use crate::transport::{decode_json, expect_array, expect_items, ApiClient, Requirement};

/// Where the items of a page live in the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemsAt {
    /// The body is a JSON array.
    Root,
    /// The body is an object with the items under this key.
    Key(&'static str),
}

/// How the next page is announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// `Link: <url>; rel="next"`.
    LinkHeader,
    /// A body field holding a token that is sent back as a query parameter.
    BodyToken {
        field: &'static str,
        param: &'static str,
    },
    /// An absolute next-page URL at `body[object][field]`, e.g. `links.next`.
    BodyLink {
        object: &'static str,
        field: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageShape {
    pub items: ItemsAt,
    pub continuation: Continuation,
}

impl PageShape {
    pub const LINK_HEADER_ARRAY: Self = Self {
        items: ItemsAt::Root,
        continuation: Continuation::LinkHeader,
    };

    pub const fn token(items_key: &'static str, field: &'static str, param: &'static str) -> Self {
        Self {
            items: ItemsAt::Key(items_key),
            continuation: Continuation::BodyToken { field, param },
        }
    }

    pub const fn body_link(items_key: &'static str, object: &'static str, field: &'static str) -> Self {
        Self {
            items: ItemsAt::Key(items_key),
            continuation: Continuation::BodyLink { object, field },
        }
    }
}

/// One fetched page and the URL of the page after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub body: Value,
    pub next: Option<String>,
}

/// Result of one bounded pagination run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageRun {
    pub items: Vec<Value>,
    pub pages: u32,
    /// Set when the cap stopped the run before the upstream ran out of pages.
    pub next: Option<String>,
}

impl PageRun {
    pub fn truncated(&self) -> bool {
        self.next.is_some()
    }
}

/// Extracts the `rel="next"` target from an RFC 5988 `Link` header.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|entry| {
        let mut segments = entry.split(';');
        let target = segments.next()?.trim();
        let is_next = segments.any(|param| {
            let param = param.trim();
            param == r#"rel="next""# || param == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|target| target.strip_suffix('>'))
            .map(str::to_owned)
    })
}

/// Fetches one page: `(items, continuation)`. `None` when an optional
/// resource is unavailable.
pub async fn fetch_page(
    client: &ApiClient,
    url: &str,
    first_url: &str,
    shape: PageShape,
    requirement: Requirement,
) -> Result<Option<Page>, ConnectorError> {
    let Some(response) = client.send(HttpRequest::get(url), requirement).await? else {
        return Ok(None);
    };
    let body = decode_json(url, &response)?;
    let items = match shape.items {
        ItemsAt::Root => expect_array(url, body.clone())?,
        ItemsAt::Key(key) => expect_items(url, &body, key)?,
    };
    let next = match shape.continuation {
        Continuation::LinkHeader => response.header("link").and_then(next_link),
        Continuation::BodyToken { field, param } => body_string(url, body.get(field), field)?
            .map(|token| append_query(first_url, [(param, token)])),
        Continuation::BodyLink { object, field } => {
            body_string(url, body.get(object).and_then(|links| links.get(field)), field)?
                .map(str::to_owned)
        }
    };
    Ok(Some(Page { items, body, next }))
}

/// A non-empty string continuation, absent when missing, null or empty.
fn body_string<'a>(url: &str, value: Option<&'a Value>, field: &str) -> Result<Option<&'a str>, ConnectorError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) if value.is_empty() => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(other) => Err(ConnectorError::protocol(
            ErrorContext::endpoint(url),
            format!("string continuation in '{field}'"),
            json_shape(other),
        )),
    }
}

/// Follows continuations from `first_url` until none remain or `max_pages`
/// pages were read.
pub async fn follow(
    client: &ApiClient,
    first_url: &str,
    shape: PageShape,
    max_pages: u32,
    requirement: Requirement,
) -> Result<PageRun, ConnectorError> {
    let mut run = PageRun::default();
    let mut next = Some(first_url.to_owned());

    while let Some(url) = next.take() {
        if run.pages >= max_pages {
            tracing::debug!(endpoint = %first_url, pages = run.pages, "page cap reached");
            run.next = Some(url);
            break;
        }
        let Some(page) = fetch_page(client, &url, first_url, shape, requirement).await? else {
            break;
        };
        run.pages += 1;
        run.items.extend(page.items);
        next = page.next;
    }

    Ok(run)
}

/// Items returned for one stream of a time-windowed page.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowStream {
    pub id: Option<String>,
    pub items: Vec<Value>,
}

/// How the window start advances after a full page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAdvance {
    /// Single stream: past the newest timestamp.
    Latest,
    /// Several streams per page: past the earliest of the streams' newest
    /// timestamps, so no stream skips values.
    EarliestAcrossStreams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPaging {
    pub max_count: usize,
    pub advance: WindowAdvance,
    pub max_pages: u32,
}

/// Result of paging through `[start, end)`.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowRun {
    pub streams: Vec<WindowStream>,
    /// Exclusive bound of what was fully read: `end`, or the next unread
    /// start when the page cap stopped the run.
    pub covered_until: OffsetDateTime,
    pub pages: u32,
}

/// Smallest time step used to move past the last seen timestamp.
pub const WINDOW_EPSILON: Duration = Duration::microseconds(1);

/// Pages through `[start, end)` by re-issuing `fetch(start, end)` with an
/// advanced start until a short page, an empty page, or `start >= end`.
pub async fn paginate_window<F, Fut>(
    start: OffsetDateTime,
    end: OffsetDateTime,
    paging: WindowPaging,
    timestamp_of: impl Fn(&Value) -> Option<OffsetDateTime>,
    mut fetch: F,
) -> Result<WindowRun, ConnectorError>
where
    F: FnMut(OffsetDateTime, OffsetDateTime) -> Fut,
    Fut: Future<Output = Result<Vec<WindowStream>, ConnectorError>>,
{
    let mut current = start;
    let mut streams = Vec::new();
    let mut pages = 0;

    while current < end {
        if pages >= paging.max_pages {
            return Ok(WindowRun {
                streams,
                covered_until: current,
                pages,
            });
        }
        let page = fetch(current, end).await?;
        pages += 1;

        let count: usize = page.iter().map(|stream| stream.items.len()).sum();
        let newest_per_stream = page
            .iter()
            .filter_map(|stream| stream.items.iter().filter_map(&timestamp_of).max())
            .collect::<Vec<_>>();
        streams.extend(page);

        if count == 0 || count < paging.max_count {
            break;
        }
        let last = match paging.advance {
            WindowAdvance::Latest => newest_per_stream.into_iter().max(),
            WindowAdvance::EarliestAcrossStreams => newest_per_stream.into_iter().min(),
        };
        let Some(last) = last else {
            break;
        };
        let advanced = last + WINDOW_EPSILON;
        if advanced <= current {
            break;
        }
        current = advanced;
    }

    Ok(WindowRun {
        streams,
        covered_until: end,
        pages,
    })
}

/// Index-based paging: `fetch(index)` returns up to `page_size` items.
pub async fn paginate_index<F, Fut>(
    start_index: u64,
    page_size: u64,
    max_total: u64,
    mut fetch: F,
) -> Result<Vec<Value>, ConnectorError>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<Vec<Value>, ConnectorError>>,
{
    let mut index = start_index;
    let mut items = Vec::new();

    while index < max_total {
        let page = fetch(index).await?;
        let received = page.len() as u64;
        items.extend(page);
        if received < page_size || page_size == 0 {
            break;
        }
        index += page_size;
    }

    Ok(items)
}
