//! Frontier coordination for the single-domain crawl.
//!
//! [`FrontierStore`] owns every collection that more than one task mutates: the
//! visited-or-queued page set, the known-image set, the link frontier, and the
//! image task queue. All of them sit behind one coarse lock so the counts can
//! never drift apart.

use crate::checkpoint::{self, CheckpointError};
use crate::html::PageReferences;
use std::collections::{HashSet, VecDeque};
use std::ops::{Add, AddAssign};
use std::path::Path;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

/// Image extensions accepted for scoring, compared case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Errors raised while seeding a crawl.
#[derive(Debug, Error)]
pub enum FrontierError {
    /// The seed URL could not be parsed.
    #[error("invalid seed url {url}: {source}")]
    InvalidSeed {
        /// Raw seed string.
        url: String,
        /// Parser failure.
        source: url::ParseError,
    },
    /// The seed URL is not http(s) or carries no host.
    #[error("seed url {0} must be an http(s) url with a host")]
    UnsupportedSeed(String),
}

/// One image awaiting scoring, paired with the page that first referenced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTask {
    /// Absolute image URL.
    pub image_url: String,
    /// Page on which the image was first discovered.
    pub page_url: String,
}

impl ImageTask {
    /// Builds a new task.
    pub fn new(image_url: impl Into<String>, page_url: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            page_url: page_url.into(),
        }
    }
}

/// Counts of genuinely new items accepted by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Discoveries {
    /// Newly queued image tasks.
    pub new_images: usize,
    /// Newly queued page URLs.
    pub new_links: usize,
}

impl Add for Discoveries {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            new_images: self.new_images + rhs.new_images,
            new_links: self.new_links + rhs.new_links,
        }
    }
}

impl AddAssign for Discoveries {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Consistent snapshot of the store's sizes, taken under the lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrontierStats {
    /// Pages ever accepted into the frontier.
    pub visited: usize,
    /// Images ever accepted into the queue.
    pub known_images: usize,
    /// Pages waiting to be fetched.
    pub pending_links: usize,
    /// Image tasks waiting to be scored.
    pub pending_images: usize,
}

impl FrontierStats {
    /// True when there is neither crawl nor scoring work left.
    pub fn is_exhausted(&self) -> bool {
        self.pending_links == 0 && self.pending_images == 0
    }
}

/// The aggregate crawl state serialized by checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlState {
    origin: Url,
    host: String,
    visited: HashSet<String>,
    images: HashSet<String>,
    links: VecDeque<String>,
    image_queue: VecDeque<ImageTask>,
}

impl CrawlState {
    /// Starts a fresh crawl seeded with `origin`.
    pub fn new(origin: &str) -> Result<Self, FrontierError> {
        let url = Url::parse(origin.trim()).map_err(|source| FrontierError::InvalidSeed {
            url: origin.to_string(),
            source,
        })?;
        if !is_http(&url) {
            return Err(FrontierError::UnsupportedSeed(origin.to_string()));
        }
        let host =
            authority(&url).ok_or_else(|| FrontierError::UnsupportedSeed(origin.to_string()))?;
        let seed = normalize(url.clone());

        let mut state = Self {
            origin: url,
            host,
            visited: HashSet::new(),
            images: HashSet::new(),
            links: VecDeque::new(),
            image_queue: VecDeque::new(),
        };
        state.visited.insert(seed.clone());
        state.links.push_back(seed);
        Ok(state)
    }

    pub(crate) fn from_parts(
        origin: Url,
        host: String,
        visited: HashSet<String>,
        images: HashSet<String>,
        links: VecDeque<String>,
        image_queue: VecDeque<ImageTask>,
    ) -> Self {
        Self {
            origin,
            host,
            visited,
            images,
            links,
            image_queue,
        }
    }

    /// The URL the crawl started from.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Authority (`host[:port]`) every internal link must share.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Every page ever accepted.
    pub fn visited(&self) -> &HashSet<String> {
        &self.visited
    }

    /// Every image ever accepted.
    pub fn known_images(&self) -> &HashSet<String> {
        &self.images
    }

    /// Pages awaiting fetch, in FIFO order.
    pub fn links(&self) -> &VecDeque<String> {
        &self.links
    }

    /// Image tasks awaiting scoring, in FIFO order.
    pub fn image_queue(&self) -> &VecDeque<ImageTask> {
        &self.image_queue
    }

    /// Current sizes of all collections.
    pub fn stats(&self) -> FrontierStats {
        FrontierStats {
            visited: self.visited.len(),
            known_images: self.images.len(),
            pending_links: self.links.len(),
            pending_images: self.image_queue.len(),
        }
    }

    /// Registers a page reference resolved against the origin URL.
    pub fn register_page(&mut self, reference: &str) -> bool {
        let origin = self.origin.clone();
        self.register_page_from(reference, &origin)
    }

    /// Registers a page reference found on `base`.
    ///
    /// Accepted only when the reference has no embedded whitespace, resolves to an
    /// http(s) URL on the origin authority, and has never been seen before.
    pub fn register_page_from(&mut self, reference: &str, base: &Url) -> bool {
        let reference = reference.trim();
        if reference.is_empty() || reference.chars().any(char::is_whitespace) {
            return false;
        }
        let Ok(url) = base.join(reference) else {
            return false;
        };
        if !is_http(&url) || authority(&url).as_deref() != Some(self.host.as_str()) {
            return false;
        }

        let normalized = normalize(url);
        if !self.visited.insert(normalized.clone()) {
            return false;
        }
        self.links.push_back(normalized);
        true
    }

    /// Registers an absolute image URL discovered on `page_url`.
    pub fn register_image(&mut self, reference: &str, page_url: &str) -> bool {
        let origin = self.origin.clone();
        self.register_image_from(reference, &origin, page_url)
    }

    /// Registers an image reference resolved against `base`.
    ///
    /// The first page to report an image owns it; later sightings are dropped.
    pub fn register_image_from(&mut self, reference: &str, base: &Url, page_url: &str) -> bool {
        let reference = reference.trim();
        if reference.is_empty() {
            return false;
        }
        let Ok(url) = base.join(reference) else {
            return false;
        };
        if !is_http(&url) || !has_image_extension(&url) {
            return false;
        }

        let normalized = normalize(url);
        if !self.images.insert(normalized.clone()) {
            return false;
        }
        self.image_queue.push_back(ImageTask::new(normalized, page_url));
        true
    }

    /// Registers everything extracted from one fetched page.
    pub fn register_references(&mut self, page: &Url, references: &PageReferences) -> Discoveries {
        let page_url = normalize(page.clone());
        let mut found = Discoveries::default();
        for src in &references.images {
            if self.register_image_from(src, page, &page_url) {
                found.new_images += 1;
            }
        }
        for href in &references.links {
            if self.register_page_from(href, page) {
                found.new_links += 1;
            }
        }
        found
    }

    /// Pops the oldest pending page.
    pub fn next_page(&mut self) -> Option<String> {
        self.links.pop_front()
    }

    /// Pops the oldest pending image task.
    pub fn next_image_task(&mut self) -> Option<ImageTask> {
        self.image_queue.pop_front()
    }

    /// Empties the image queue, oldest task first.
    pub fn take_image_tasks(&mut self) -> Vec<ImageTask> {
        self.image_queue.drain(..).collect()
    }

    /// Puts unprocessed tasks back at the head of the queue, keeping their order.
    ///
    /// Only tasks whose image is already known are restored.
    pub fn requeue_image_tasks(&mut self, tasks: Vec<ImageTask>) -> usize {
        let mut restored = 0;
        for task in tasks.into_iter().rev() {
            if self.images.contains(&task.image_url) {
                self.image_queue.push_front(task);
                restored += 1;
            }
        }
        restored
    }
}

/// Thread-safe owner of [`CrawlState`].
///
/// Every operation, including checkpoint writes, runs under the same lock.
pub struct FrontierStore {
    state: Mutex<CrawlState>,
}

impl FrontierStore {
    /// Wraps an existing state.
    pub fn new(state: CrawlState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Starts a fresh crawl from `origin`.
    pub fn seeded(origin: &str) -> Result<Self, FrontierError> {
        CrawlState::new(origin).map(Self::new)
    }

    /// Restores a store from a checkpoint file.
    pub async fn restore(path: &Path) -> Result<Self, CheckpointError> {
        checkpoint::load(path).await.map(Self::new)
    }

    /// See [`CrawlState::register_page`].
    pub async fn register_page(&self, url: &str) -> bool {
        self.state.lock().await.register_page(url)
    }

    /// See [`CrawlState::register_image`].
    pub async fn register_image(&self, url: &str, discovered_from: &str) -> bool {
        self.state.lock().await.register_image(url, discovered_from)
    }

    /// Registers one page's references under a single lock acquisition.
    pub async fn register_references(
        &self,
        page: &Url,
        references: &PageReferences,
    ) -> Discoveries {
        self.state.lock().await.register_references(page, references)
    }

    /// Pops the oldest pending page, or `None` when the frontier is empty.
    pub async fn next_page(&self) -> Option<String> {
        self.state.lock().await.next_page()
    }

    /// Pops up to `limit` pages in FIFO order.
    pub async fn next_pages(&self, limit: usize) -> Vec<String> {
        let mut state = self.state.lock().await;
        let take = limit.min(state.links.len());
        state.links.drain(..take).collect()
    }

    /// Pops the oldest image task, or `None` when the queue is empty.
    pub async fn next_image_task(&self) -> Option<ImageTask> {
        self.state.lock().await.next_image_task()
    }

    /// Takes every queued image task in one lock acquisition.
    pub async fn take_image_tasks(&self) -> Vec<ImageTask> {
        self.state.lock().await.take_image_tasks()
    }

    /// See [`CrawlState::requeue_image_tasks`].
    pub async fn requeue_image_tasks(&self, tasks: Vec<ImageTask>) -> usize {
        self.state.lock().await.requeue_image_tasks(tasks)
    }

    /// Current sizes of all collections.
    pub async fn stats(&self) -> FrontierStats {
        self.state.lock().await.stats()
    }

    /// Clones the full state.
    pub async fn snapshot(&self) -> CrawlState {
        self.state.lock().await.clone()
    }

    /// Writes a checkpoint while holding the store lock.
    pub async fn checkpoint(&self, path: &Path) -> Result<(), CheckpointError> {
        let state = self.state.lock().await;
        checkpoint::save(path, &state).await
    }
}

fn is_http(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// Returns `host[:port]`, with the port only when it is not the scheme default.
pub fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn has_image_extension(url: &Url) -> bool {
    let Some(name) = url.path().rsplit('/').next() else {
        return false;
    };
    let Some((_, ext)) = name.rsplit_once('.') else {
        return false;
    };
    IMAGE_EXTENSIONS
        .iter()
        .any(|allowed| ext.eq_ignore_ascii_case(allowed))
}

// Fragments never change the fetched document. `|` separates checkpoint pairs.
fn normalize(mut url: Url) -> String {
    url.set_fragment(None);
    url.as_str().replace('|', "%7C")
}
