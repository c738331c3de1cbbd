//! Follow-the-next-link pagination.
//!
//! A [`Paginator`] walks the continuation chain of one logical request and
//! decodes every page into typed items, in server order.
//!
//! # Termination
//!
//! ```text
//! P1 ─next─▶ P2 ─next─▶ P3 ─none─▶ done        drain_all = P1 ++ P2 ++ P3
//! P1 ─next─▶ P2 ─next─▶ P1                      Err(CycleDetected)
//! P1 ─next─▶ P2 ─error                          Err(..), nothing returned
//! ```
//!
//! A drain is all-or-nothing: any page failure fails the drain and the pages
//! already retrieved are dropped. Callers that want page-by-page persistence use
//! [`Paginator::cursor`] and decide themselves what to keep.

use crate::cancel::Cancellation;
use crate::error::{Error, Result};
use crate::transport::{PageRequest, Transport};
use futures::Stream;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::marker::PhantomData;

/// Default hard cap on pages per drain.
pub const DEFAULT_MAX_PAGES: usize = 10_000;

/// Drains a paginated resource through a [`Transport`].
pub struct Paginator<'t, T: Transport> {
    transport: &'t T,
    request: PageRequest,
    max_pages: usize,
    cancel: Cancellation,
}

impl<'t, T: Transport> Paginator<'t, T> {
    pub fn new(transport: &'t T, request: PageRequest) -> Self {
        Paginator {
            transport,
            request,
            max_pages: DEFAULT_MAX_PAGES,
            cancel: Cancellation::new(),
        }
    }

    /// Fail with `CycleDetected` after this many pages.
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Abort the drain when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Step through the pages one at a time.
    pub fn cursor<R: DeserializeOwned>(&self) -> PageCursor<'_, 't, T, R> {
        let mut seen = HashSet::new();
        seen.insert(self.request.route().to_string());
        PageCursor {
            paginator: self,
            next: Some(self.request.clone()),
            seen,
            pages: 0,
            _marker: PhantomData,
        }
    }

    /// Lazy stream of decoded pages. Ends after the last page or the first error.
    pub fn pages<R: DeserializeOwned + 't>(&'t self) -> impl Stream<Item = Result<Vec<R>>> + 't {
        futures::stream::try_unfold(self.cursor::<R>(), |mut cursor| async move {
            let page = cursor.next_page().await?;
            Ok(page.map(|items| (items, cursor)))
        })
    }

    /// Follow the continuation chain to the end and concatenate every page.
    ///
    /// # Errors
    ///
    /// - `Error::Network` / `Error::Decoding` from any page
    /// - `Error::CycleDetected` when a token repeats or the page cap is hit
    /// - `Error::Cancelled` when the cancellation fires mid-drain
    pub async fn drain_all<R: DeserializeOwned>(&self) -> Result<Vec<R>> {
        let mut cursor = self.cursor::<R>();
        let mut items = Vec::new();
        while let Some(page) = cursor.next_page().await? {
            items.extend(page);
        }
        debug!(
            "✓ Drained {} ({} pages, {} items)",
            self.request.endpoint,
            cursor.pages(),
            items.len()
        );
        Ok(items)
    }
}

/// Position within a paginated drain.
pub struct PageCursor<'p, 't, T: Transport, R> {
    paginator: &'p Paginator<'t, T>,
    next: Option<PageRequest>,
    seen: HashSet<String>,
    pages: usize,
    _marker: PhantomData<fn() -> R>,
}

impl<'p, 't, T: Transport, R: DeserializeOwned> PageCursor<'p, 't, T, R> {
    /// Pages fetched so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn is_exhausted(&self) -> bool {
        self.next.is_none()
    }

    /// Fetch and decode the next page. `Ok(None)` once the chain is exhausted.
    ///
    /// After an error the cursor is exhausted.
    ///
    /// # Errors
    ///
    /// Same as [`Paginator::drain_all`].
    pub async fn next_page(&mut self) -> Result<Option<Vec<R>>> {
        let request = match self.next.take() {
            Some(request) => request,
            None => return Ok(None),
        };
        let paginator = self.paginator;
        paginator.cancel.check()?;

        self.pages += 1;
        if self.pages > paginator.max_pages {
            warn!(
                "Page cap {} exceeded for {}",
                paginator.max_pages, paginator.request.endpoint
            );
            return Err(Error::CycleDetected(request.route().to_string()));
        }

        let page = tokio::select! {
            biased;
            _ = paginator.cancel.cancelled() => {
                debug!("Drain of {} cancelled at page {}", paginator.request.endpoint, self.pages);
                return Err(Error::Cancelled);
            }
            page = paginator.transport.request(&request) => page?,
        };

        let items = page
            .items
            .into_iter()
            .map(serde_json::from_value::<R>)
            .collect::<std::result::Result<Vec<R>, _>>()
            .map_err(|e| {
                Error::Decoding(format!("page {} of {}: {}", self.pages, request.route(), e))
            })?;

        debug!(
            "Fetched page {} of {} ({} items)",
            self.pages,
            paginator.request.endpoint,
            items.len()
        );

        if let Some(token) = page.next {
            if !self.seen.insert(token.clone()) {
                warn!(
                    "Continuation token {} repeated while draining {}",
                    token, paginator.request.endpoint
                );
                return Err(Error::CycleDetected(token));
            }
            self.next = Some(request.continue_with(token));
        }

        Ok(Some(items))
    }
}

/// Drain `request` completely. Shorthand for `Paginator::new(..).drain_all()`.
///
/// # Errors
///
/// Same as [`Paginator::drain_all`].
pub async fn drain_all<T: Transport, R: DeserializeOwned>(
    transport: &T,
    request: PageRequest,
) -> Result<Vec<R>> {
    Paginator::new(transport, request).drain_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Page, StaticTransport};
    use futures::TryStreamExt;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
    }

    fn ids(items: &[Item]) -> Vec<u32> {
        items.iter().map(|i| i.id).collect()
    }

    #[tokio::test]
    async fn test_drain_concatenates_pages_in_order() {
        let transport = StaticTransport::new();
        transport.insert("p1", Page::new(vec![json!({"id": 1}), json!({"id": 2})]).with_next("p2"));
        transport.insert("p2", Page::new(vec![json!({"id": 3})]).with_next("p3"));
        transport.insert("p3", Page::new(vec![json!({"id": 4})]));

        let items: Vec<Item> = drain_all(&transport, PageRequest::new("p1"))
            .await
            .expect("Failed to drain");
        assert_eq!(ids(&items), vec![1, 2, 3, 4]);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_empty_first_page() {
        let transport = StaticTransport::new();
        transport.insert("p1", Page::new(vec![]));

        let items: Vec<Item> = drain_all(&transport, PageRequest::new("p1"))
            .await
            .expect("Failed to drain");
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_detected() {
        let transport = StaticTransport::new();
        transport.insert("p1", Page::new(vec![json!({"id": 1})]).with_next("p2"));
        transport.insert("p2", Page::new(vec![json!({"id": 2})]).with_next("p1"));

        let result: Result<Vec<Item>> = drain_all(&transport, PageRequest::new("p1")).await;
        assert_eq!(result.unwrap_err(), Error::CycleDetected("p1".to_string()));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_self_link_is_a_cycle() {
        let transport = StaticTransport::new();
        transport.insert("p1", Page::new(vec![]).with_next("p2"));
        transport.insert("p2", Page::new(vec![]).with_next("p2"));

        let result: Result<Vec<Item>> = drain_all(&transport, PageRequest::new("p1")).await;
        assert!(matches!(result, Err(Error::CycleDetected(_))));
    }

    #[tokio::test]
    async fn test_page_cap() {
        let transport = StaticTransport::new();
        let items = (1..=10).map(|id| json!({ "id": id })).collect();
        transport.insert_chain("things", items, 1);

        let result: Result<Vec<Item>> = Paginator::new(&transport, PageRequest::new("things"))
            .with_max_pages(3)
            .drain_all()
            .await;
        assert!(matches!(result, Err(Error::CycleDetected(_))));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_page_error_fails_whole_drain() {
        let transport = StaticTransport::new();
        transport.insert("p1", Page::new(vec![json!({"id": 1})]).with_next("p2"));
        transport.fail("p2", Error::network(502, "bad gateway"));

        let result: Result<Vec<Item>> = drain_all(&transport, PageRequest::new("p1")).await;
        assert_eq!(result.unwrap_err().status(), Some(502));
    }

    #[tokio::test]
    async fn test_decoding_error() {
        let transport = StaticTransport::new();
        transport.insert("p1", Page::new(vec![json!({"id": "not a number"})]));

        let result: Result<Vec<Item>> = drain_all(&transport, PageRequest::new("p1")).await;
        assert!(matches!(result, Err(Error::Decoding(_))));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let transport = StaticTransport::new();
        transport.insert("p1", Page::new(vec![json!({"id": 1})]));
        let cancel = Cancellation::new();
        cancel.cancel();

        let result: Result<Vec<Item>> = Paginator::new(&transport, PageRequest::new("p1"))
            .with_cancellation(cancel)
            .drain_all()
            .await;
        assert_eq!(result.unwrap_err(), Error::Cancelled);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_page() {
        let transport = StaticTransport::new();
        transport.insert("p1", Page::new(vec![json!({"id": 1})]));
        transport.set_delay(Duration::from_secs(30));
        let cancel = Cancellation::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            Paginator::new(&transport, PageRequest::new("p1"))
                .with_cancellation(cancel)
                .drain_all::<Item>(),
        )
        .await
        .expect("cancellation should abort the in-flight page");
        assert_eq!(result.unwrap_err(), Error::Cancelled);
    }

    #[tokio::test]
    async fn test_pages_stream() {
        let transport = StaticTransport::new();
        let items = (1..=5).map(|id| json!({ "id": id })).collect();
        transport.insert_chain("things", items, 2);

        let paginator = Paginator::new(&transport, PageRequest::new("things"));
        let pages: Vec<Vec<Item>> = paginator
            .pages()
            .try_collect()
            .await
            .expect("Failed to stream");
        let sizes: Vec<usize> = pages.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_cursor_is_exhausted_after_error() {
        let transport = StaticTransport::new();
        transport.fail("p1", Error::network(None, "offline"));

        let paginator = Paginator::new(&transport, PageRequest::new("p1"));
        let mut cursor = paginator.cursor::<Item>();
        assert!(cursor.next_page().await.is_err());
        assert!(cursor.is_exhausted());
        assert!(cursor.next_page().await.expect("no more pages").is_none());
    }
}
