//! Drains the image queue through the face oracle.

use crate::fetch::Fetcher;
use crate::frontier::{FrontierStore, ImageTask};
use crate::metrics::Metrics;
use crate::oracle::{FaceOracle, OracleError};
use crate::output::{annotate, MatchRecord, OutputError, OutputLayout};
use futures_util::{stream, StreamExt};
use std::pin::pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default promising threshold.
pub const DEFAULT_THRESHOLD: f32 = 0.3;

/// Failures that abort a scoring pass.
///
/// Per-image download, decode and image-write problems never surface here.
#[derive(Debug, Error)]
pub enum ScoringError {
    /// The oracle failed; the task being scored is lost.
    #[error("oracle failed on {image_url}: {source}")]
    Oracle {
        /// Image being scored.
        image_url: String,
        /// Backend failure.
        source: OracleError,
    },
    /// The match log could not be appended.
    #[error(transparent)]
    Output(#[from] OutputError),
}

/// Scoring knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringConfig {
    /// Scores strictly above this are promising.
    pub threshold: f32,
    /// Persist every scored image, not only promising ones.
    pub save_all: bool,
    /// Image downloads kept in flight ahead of the oracle.
    pub download_concurrency: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            save_all: false,
            download_concurrency: 8,
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Tasks taken off the queue.
    pub attempted: usize,
    /// Tasks dropped before a score (download, decode, no faces).
    pub skipped: usize,
    /// Tasks that produced a score.
    pub scored: usize,
    /// Scores above the threshold.
    pub promising: usize,
}

/// Single-consumer scoring loop over the shared image queue.
pub struct ScoringLoop {
    store: Arc<FrontierStore>,
    fetcher: Arc<dyn Fetcher>,
    oracle: Arc<dyn FaceOracle>,
    reference: Vec<f32>,
    output: OutputLayout,
    config: ScoringConfig,
    metrics: Arc<Metrics>,
}

enum Outcome {
    Skipped,
    Scored { promising: bool },
}

impl ScoringLoop {
    /// Builds a loop comparing every face against `reference`.
    pub fn new(
        store: Arc<FrontierStore>,
        fetcher: Arc<dyn Fetcher>,
        oracle: Arc<dyn FaceOracle>,
        reference: Vec<f32>,
        output: OutputLayout,
        config: ScoringConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            fetcher,
            oracle,
            reference,
            output,
            config,
            metrics,
        }
    }

    /// Where results are written.
    pub fn output(&self) -> &OutputLayout {
        &self.output
    }

    /// Scores the tasks queued at entry; tasks queued meanwhile wait for the next pass.
    ///
    /// Downloads run ahead concurrently, while oracle calls and writes stay in queue
    /// order, one at a time. When the oracle fails, the task being scored is lost and
    /// every task after it goes back to the head of the queue.
    pub async fn run_pass(&self) -> Result<PassSummary, ScoringError> {
        let tasks = self.store.take_image_tasks().await;
        let fetcher = &self.fetcher;

        let mut downloads = pin!(stream::iter(&tasks)
            .map(|task| async move { (task, fetcher.get_image_bytes(&task.image_url).await) })
            .buffered(self.config.download_concurrency.max(1)));

        let mut summary = PassSummary::default();
        while let Some((task, bytes)) = downloads.next().await {
            summary.attempted += 1;

            let bytes = match bytes {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(image = task.image_url.as_str(), error = %err, "image download failed");
                    self.skip(&mut summary);
                    continue;
                }
            };

            let outcome = match self.score(task, &bytes).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let unscored = tasks[summary.attempted..].to_vec();
                    let restored = self.store.requeue_image_tasks(unscored).await;
                    warn!(
                        image = task.image_url.as_str(),
                        restored,
                        "scoring pass aborted; unscored images returned to the queue"
                    );
                    return Err(err);
                }
            };
            match outcome {
                Outcome::Skipped => self.skip(&mut summary),
                Outcome::Scored { promising } => {
                    summary.scored += 1;
                    self.metrics.record_scored();
                    if promising {
                        summary.promising += 1;
                        self.metrics.record_promising();
                    }
                }
            }
        }
        Ok(summary)
    }

    fn skip(&self, summary: &mut PassSummary) {
        summary.skipped += 1;
        self.metrics.record_skipped();
    }

    async fn score(&self, task: &ImageTask, bytes: &[u8]) -> Result<Outcome, ScoringError> {
        let image = match image::load_from_memory(bytes) {
            Ok(image) => image,
            Err(err) => {
                debug!(image = task.image_url.as_str(), error = %err, "undecodable image");
                return Ok(Outcome::Skipped);
            }
        };

        let faces = self
            .oracle
            .detect(bytes)
            .await
            .map_err(|source| ScoringError::Oracle {
                image_url: task.image_url.clone(),
                source,
            })?;
        if faces.is_empty() {
            return Ok(Outcome::Skipped);
        }

        let Some(best) = faces
            .iter()
            .filter_map(|face| self.oracle.similarity(&self.reference, &face.embedding))
            .reduce(f32::max)
        else {
            debug!(image = task.image_url.as_str(), "no comparable face embeddings");
            return Ok(Outcome::Skipped);
        };

        let promising = best > self.config.threshold;
        if self.config.save_all || promising {
            let annotated = annotate(&image, &faces);
            if self.config.save_all {
                if let Err(err) = self.output.save_scored(&task.image_url, &annotated) {
                    warn!(image = task.image_url.as_str(), error = %err, "could not save image");
                }
            }
            if promising {
                let score = format!("{best:.2}");
                info!(
                    score = %score,
                    page = task.page_url.as_str(),
                    image = task.image_url.as_str(),
                    "found a promising face"
                );
                if let Err(err) = self.output.save_promising(&task.image_url, &annotated) {
                    warn!(image = task.image_url.as_str(), error = %err, "could not save image");
                }
                self.output.append_match(&MatchRecord {
                    score: best,
                    image_url: task.image_url.clone(),
                    page_url: task.page_url.clone(),
                })?;
            }
        }
        Ok(Outcome::Scored { promising })
    }
}
