//! Link-header pagination.
//!
//! Page 1 is fetched with GET. Later page URLs are discovered one at a time
//! by following `rel="next"` with HEAD requests, then every discovered page
//! is fetched by a small worker pool. Items come back grouped by page in
//! completion order, so callers must not rely on ordering.

use std::collections::HashSet;

use log::{debug, warn};
use serde::de::DeserializeOwned;

use crate::client::{decode_body, GitHubClient};
use crate::error::Result;
use crate::http::HttpMethod;
use crate::link::next_page_url;
use crate::pool::run_pool;

/// Items gathered by one pagination walk, plus what could not be gathered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageWalk<T> {
    pub items: Vec<T>,
    /// Discovered pages whose fetch failed.
    pub lost_pages: usize,
    /// Discovery ended on an error, so pages past the last known one may exist.
    pub truncated: bool,
}

impl<T> PageWalk<T> {
    fn complete(items: Vec<T>) -> Self {
        Self {
            items,
            lost_pages: 0,
            truncated: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.lost_pages == 0 && !self.truncated
    }

    /// What is missing from `items`, or `None` when nothing is.
    pub fn gap(&self) -> Option<String> {
        match (self.lost_pages, self.truncated) {
            (0, false) => None,
            (0, true) => Some("page discovery stopped early".to_string()),
            (lost, false) => Some(format!("{} pages unavailable", lost)),
            (lost, true) => Some(format!(
                "{} pages unavailable, page discovery stopped early",
                lost
            )),
        }
    }
}

impl GitHubClient {
    /// Every item reachable from `route` by following `Link` headers.
    ///
    /// A failing first page fails the walk, except GitHub's "Git Repository
    /// is empty." signal which yields no items. Failures on later pages are
    /// logged and counted in the returned walk.
    pub async fn fetch_all_pages<T>(&self, route: &str) -> Result<PageWalk<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let first_url = self.resolve_url(route);

        let first = match self.send(HttpMethod::Get, &first_url).await {
            Ok(response) => response,
            Err(e) if e.is_empty_repository() => {
                debug!("{} points at an empty repository", first_url);
                return Ok(PageWalk::complete(Vec::new()));
            }
            Err(e) => return Err(e),
        };

        let items: Vec<T> = decode_body(&first_url, &first)?;

        let Some(next) = first.header("link").and_then(next_page_url) else {
            return Ok(PageWalk::complete(items));
        };

        let (pages, truncated) = self.discover_pages(next).await;
        debug!("{} has {} more pages", first_url, pages.len());

        let client = self.clone();
        let fetched = run_pool(pages, self.config().concurrency.page_workers, move |url: String| {
            let client = client.clone();
            async move {
                let result = client.fetch_page::<T>(&url).await;
                (url, result)
            }
        })
        .await;

        let mut walk = PageWalk {
            items,
            lost_pages: 0,
            truncated,
        };
        for (url, result) in fetched {
            match result {
                Ok(mut page) => walk.items.append(&mut page),
                Err(e) => {
                    warn!("Skipping page {}: {}", url, e);
                    walk.lost_pages += 1;
                }
            }
        }

        Ok(walk)
    }

    /// Walk `rel="next"` from `start` with HEAD requests.
    ///
    /// The returned list always starts with `start`. A failed HEAD ends
    /// discovery and sets the flag; the pages already known are still
    /// returned.
    async fn discover_pages(&self, start: String) -> (Vec<String>, bool) {
        let mut pages = Vec::new();
        let mut seen = HashSet::new();
        let mut next = start;

        loop {
            if !seen.insert(next.clone()) {
                warn!("Pagination loops back to {}, stopping discovery", next);
                break;
            }
            pages.push(next.clone());

            match self.send(HttpMethod::Head, &next).await {
                Ok(response) => match response.header("link").and_then(next_page_url) {
                    Some(url) => next = url,
                    None => break,
                },
                Err(e) => {
                    warn!("Page discovery stopped at {}: {}", next, e);
                    return (pages, true);
                }
            }
        }

        (pages, false)
    }

    async fn fetch_page<T: DeserializeOwned>(&self, url: &str) -> Result<Vec<T>> {
        let response = self.send(HttpMethod::Get, url).await?;
        decode_body(url, &response)
    }
}
