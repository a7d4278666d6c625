//! Single-page fetch and reference extraction.

use crate::fetch::{FetchError, Fetcher};
use crate::frontier::{Discoveries, FrontierStore};
use crate::html::extract_references;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Fetches one page and submits its references to the frontier.
#[derive(Clone)]
pub struct PageExtractor {
    fetcher: Arc<dyn Fetcher>,
    store: Arc<FrontierStore>,
}

impl PageExtractor {
    /// Creates an extractor over a shared store.
    pub fn new(fetcher: Arc<dyn Fetcher>, store: Arc<FrontierStore>) -> Self {
        Self { fetcher, store }
    }

    /// The store discoveries are submitted to.
    pub fn store(&self) -> &Arc<FrontierStore> {
        &self.store
    }

    /// Fetches `url` and returns how many images and links were genuinely new.
    ///
    /// References resolve against the final page URL, not the crawl origin. Failed
    /// pages are never revisited.
    pub async fn fetch(&self, url: &str) -> Result<Discoveries, FetchError> {
        let response = self.fetcher.get_page(url).await?;
        if !response.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status,
            });
        }
        if !response.is_html() {
            debug!(url, content_type = ?response.content_type, "skipping non-html page");
            return Ok(Discoveries::default());
        }

        let base = Url::parse(&response.url).map_err(|source| FetchError::Url {
            url: response.url.clone(),
            source,
        })?;
        let references = extract_references(&response.body).map_err(|source| FetchError::Html {
            url: url.to_string(),
            source,
        })?;

        let found = self.store.register_references(&base, &references).await;
        debug!(
            url,
            images = references.images.len(),
            links = references.links.len(),
            new_images = found.new_images,
            new_links = found.new_links,
            "page extracted"
        );
        Ok(found)
    }
}
