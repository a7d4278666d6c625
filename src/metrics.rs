//! Run-wide counters reported when the crawler exits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Atomic counters shared by every pipeline stage.
#[derive(Debug, Default)]
pub struct Metrics {
    pages_fetched: AtomicUsize,
    fetch_failures: AtomicUsize,
    links_enqueued: AtomicUsize,
    images_enqueued: AtomicUsize,
    images_scored: AtomicUsize,
    images_skipped: AtomicUsize,
    promising_matches: AtomicUsize,
    iteration_failures: AtomicUsize,
    checkpoints_written: AtomicUsize,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Pages fetched and parsed.
    pub pages_fetched: usize,
    /// Page fetches that failed.
    pub fetch_failures: usize,
    /// New links accepted into the frontier.
    pub links_enqueued: usize,
    /// New images accepted into the queue.
    pub images_enqueued: usize,
    /// Images that reached a similarity score.
    pub images_scored: usize,
    /// Image tasks dropped before scoring.
    pub images_skipped: usize,
    /// Scores above the promising threshold.
    pub promising_matches: usize,
    /// Iterations that ended in an error.
    pub iteration_failures: usize,
    /// Checkpoints written.
    pub checkpoints_written: usize,
}

impl Metrics {
    pub(crate) fn record_page_fetched(&self) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_enqueued(&self, links: usize, images: usize) {
        self.links_enqueued.fetch_add(links, Ordering::Relaxed);
        self.images_enqueued.fetch_add(images, Ordering::Relaxed);
    }

    pub(crate) fn record_scored(&self) {
        self.images_scored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.images_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_promising(&self) {
        self.promising_matches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_iteration_failure(&self) {
        self.iteration_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            links_enqueued: self.links_enqueued.load(Ordering::Relaxed),
            images_enqueued: self.images_enqueued.load(Ordering::Relaxed),
            images_scored: self.images_scored.load(Ordering::Relaxed),
            images_skipped: self.images_skipped.load(Ordering::Relaxed),
            promising_matches: self.promising_matches.load(Ordering::Relaxed),
            iteration_failures: self.iteration_failures.load(Ordering::Relaxed),
            checkpoints_written: self.checkpoints_written.load(Ordering::Relaxed),
        }
    }

    /// Prints the end-of-run summary.
    pub fn report(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f32().max(f32::EPSILON);
        let snap = self.snapshot();
        println!("--- crawl metrics ({secs:.2}s) ---");
        println!("pages fetched: {}", snap.pages_fetched);
        println!("pages fetched/sec: {:.2}", snap.pages_fetched as f32 / secs);
        println!("fetch failures: {}", snap.fetch_failures);
        println!("links enqueued: {}", snap.links_enqueued);
        println!("images enqueued: {}", snap.images_enqueued);
        println!("images scored: {}", snap.images_scored);
        println!("images skipped: {}", snap.images_skipped);
        println!("promising matches: {}", snap.promising_matches);
        println!("iteration failures: {}", snap.iteration_failures);
        println!("checkpoints written: {}", snap.checkpoints_written);
    }
}
