//! Transport collaborator: one request, one page.
//!
//! The engine never speaks HTTP itself. A [`Transport`] turns a [`PageRequest`]
//! into a [`Page`] of raw JSON items plus an optional continuation token taken
//! from response metadata (a `Link: rel="next"` URL, a cursor field, ...).
//! Timeouts belong to the transport and surface as `Error::Network`.
//!
//! # Implementing Transport
//!
//! ```ignore
//! use sync_kit::transport::{Page, PageRequest, Transport};
//!
//! struct HttpTransport { client: reqwest::Client, base: String }
//!
//! impl Transport for HttpTransport {
//!     async fn request(&self, request: &PageRequest) -> sync_kit::Result<Page> {
//!         let url = match &request.page_token {
//!             Some(next) => next.clone(),
//!             None => format!("{}/{}", self.base, request.endpoint),
//!         };
//!         // ... send, map status to Error::Network, parse Link header ...
//!         # unimplemented!()
//!     }
//! }
//! ```

use crate::error::{Error, Result};
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Request for one page of a paginated resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageRequest {
    /// Resource path relative to the session's base endpoint.
    pub endpoint: String,
    /// Query parameters of the first page.
    pub params: Vec<(String, String)>,
    /// Continuation token of a follow-up page. `None` for the first page.
    pub page_token: Option<String>,
}

impl PageRequest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        PageRequest {
            endpoint: endpoint.into(),
            params: Vec::new(),
            page_token: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Request for the page behind `token`.
    pub fn continue_with(&self, token: impl Into<String>) -> Self {
        PageRequest {
            endpoint: self.endpoint.clone(),
            params: self.params.clone(),
            page_token: Some(token.into()),
        }
    }

    /// The token for this request, or the endpoint for the first page.
    pub fn route(&self) -> &str {
        self.page_token.as_deref().unwrap_or(&self.endpoint)
    }
}

/// One page of raw items.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub next: Option<String>,
}

impl Page {
    pub fn new(items: Vec<Value>) -> Self {
        Page { items, next: None }
    }

    pub fn with_next(mut self, token: impl Into<String>) -> Self {
        self.next = Some(token.into());
        self
    }
}

/// Trait for the remote side of a refresh.
pub trait Transport: Send + Sync + 'static {
    /// Fetch one page.
    ///
    /// # Errors
    /// `Error::Network` with the status code on HTTP failures, `Error::Decoding`
    /// when the envelope cannot be parsed.
    fn request(&self, request: &PageRequest) -> impl Future<Output = Result<Page>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn request(&self, request: &PageRequest) -> impl Future<Output = Result<Page>> + Send {
        (**self).request(request)
    }
}

// ============================================================================
// Static Test Transport
// ============================================================================

/// Canned-response transport for tests and offline demos.
///
/// Pages are keyed by [`PageRequest::route`]: the endpoint for first pages, the
/// continuation token for the rest. Responses can be swapped between refreshes.
///
/// ```
/// use serde_json::json;
/// use sync_kit::transport::{Page, StaticTransport};
///
/// let transport = StaticTransport::new();
/// transport.insert("courses/1/modules", Page::new(vec![json!({"id": 1})]).with_next("p2"));
/// transport.insert("p2", Page::new(vec![json!({"id": 2})]));
/// ```
#[derive(Clone, Default)]
pub struct StaticTransport {
    pages: Arc<DashMap<String, Result<Page>>>,
    calls: Arc<AtomicUsize>,
    delay_ms: Arc<AtomicU64>,
}

impl StaticTransport {
    pub fn new() -> Self {
        StaticTransport::default()
    }

    /// Serve `page` for `route`.
    pub fn insert(&self, route: impl Into<String>, page: Page) {
        self.pages.insert(route.into(), Ok(page));
    }

    /// Fail requests for `route` with `error`.
    pub fn fail(&self, route: impl Into<String>, error: Error) {
        self.pages.insert(route.into(), Err(error));
    }

    /// Serve `items` as a chain of pages from `endpoint`, `per_page` items each.
    /// Continuation tokens are `"{endpoint}?page={n}"`.
    pub fn insert_chain(&self, endpoint: &str, items: Vec<Value>, per_page: usize) {
        let per_page = per_page.max(1);
        let chunks: Vec<Vec<Value>> = items.chunks(per_page).map(|c| c.to_vec()).collect();
        let total = chunks.len().max(1);
        for n in 0..total {
            let route = if n == 0 {
                endpoint.to_string()
            } else {
                format!("{}?page={}", endpoint, n + 1)
            };
            let mut page = Page::new(chunks.get(n).cloned().unwrap_or_default());
            if n + 1 < total {
                page = page.with_next(format!("{}?page={}", endpoint, n + 2));
            }
            self.insert(route, page);
        }
    }

    /// Delay every response, to hold refreshes in flight.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of requests served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.pages.clear();
    }
}

impl Transport for StaticTransport {
    async fn request(&self, request: &PageRequest) -> Result<Page> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let route = request.route();
        match self.pages.get(route) {
            Some(response) => response.value().clone(),
            None => Err(Error::network(404, format!("no page for {}", route))),
        }
    }
}
