//! Bulk-synchronous crawl ticks.

use crate::frontier::Discoveries;
use crate::metrics::Metrics;
use crate::page::PageExtractor;
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::warn;

/// Outcome of one [`CrawlScheduler::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Pages popped and fetched in this tick.
    pub dispatched: usize,
    /// Fetches that failed.
    pub failed: usize,
    /// New images and links accepted across all fetches.
    pub discoveries: Discoveries,
}

impl TickReport {
    /// True when the frontier was empty and nothing was dispatched.
    pub fn is_idle(&self) -> bool {
        self.dispatched == 0
    }
}

/// Drives bounded batches of concurrent page fetches.
pub struct CrawlScheduler {
    extractor: PageExtractor,
    metrics: Arc<Metrics>,
}

impl CrawlScheduler {
    /// Creates a scheduler around a page extractor.
    pub fn new(extractor: PageExtractor, metrics: Arc<Metrics>) -> Self {
        Self { extractor, metrics }
    }

    /// Pops up to `concurrency` pages, fetches them all at once, and waits for every
    /// fetch before returning.
    ///
    /// A failed fetch contributes nothing and does not cancel its siblings.
    pub async fn tick(&self, concurrency: usize) -> TickReport {
        let urls = self.extractor.store().next_pages(concurrency.max(1)).await;
        if urls.is_empty() {
            return TickReport::default();
        }

        let results = join_all(urls.iter().map(|url| self.extractor.fetch(url))).await;

        let mut report = TickReport {
            dispatched: urls.len(),
            ..TickReport::default()
        };
        for (url, result) in urls.iter().zip(results) {
            match result {
                Ok(found) => {
                    self.metrics.record_page_fetched();
                    self.metrics.record_enqueued(found.new_links, found.new_images);
                    report.discoveries += found;
                }
                Err(err) => {
                    warn!(url = url.as_str(), error = %err, "page fetch failed");
                    self.metrics.record_fetch_failure();
                    report.failed += 1;
                }
            }
        }
        report
    }
}
