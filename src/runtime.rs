//! Application runner: iteration loop, backoff, shutdown, and process wiring.

use crate::checkpoint::CheckpointError;
use crate::controls::CrawlControls;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::frontier::{Discoveries, FrontierError, FrontierStats, FrontierStore};
use crate::metrics::Metrics;
use crate::oracle::{FaceOracle, OracleError, RemoteFaceOracle};
use crate::output::{OutputError, OutputLayout};
use crate::page::PageExtractor;
use crate::scheduler::CrawlScheduler;
use crate::scoring::{PassSummary, ScoringError, ScoringLoop};
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Builder;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Failures that end an iteration, or startup when they happen before the loop.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Checkpoint read or write failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    /// The scoring pass was aborted.
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    /// The seed URL was rejected.
    #[error(transparent)]
    Frontier(#[from] FrontierError),
    /// The run directory could not be prepared.
    #[error(transparent)]
    Output(#[from] OutputError),
    /// The face oracle failed outside a scoring pass.
    #[error(transparent)]
    Oracle(#[from] OracleError),
    /// The HTTP client could not be built.
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
    /// The reference image could not be read.
    #[error("failed to read reference image {}: {source}", path.display())]
    Reference {
        /// Reference image path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The oracle found no face in the reference image.
    #[error("no face detected in reference image {}", .0.display())]
    NoReferenceFace(PathBuf),
    /// The async runtime could not start.
    #[error("failed to start runtime: {0}")]
    Runtime(std::io::Error),
}

/// Exponential delay after consecutive failed iterations.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: f64,
    consecutive: u32,
    max_delay: Duration,
}

impl Backoff {
    /// Creates a backoff growing as `base^n` seconds, capped at `max_delay`.
    pub fn new(base: f64, max_delay: Duration) -> Self {
        Self {
            base: base.max(1.0),
            consecutive: 0,
            max_delay,
        }
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    /// Delay for the current failure streak, then counts one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.consecutive).unwrap_or(i32::MAX);
        let secs = self.base.powi(exponent);
        self.consecutive = self.consecutive.saturating_add(1);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Clears the failure streak after a successful iteration.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// Cooperative stop signal shared between the signal handler and the loop.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    /// Creates an untriggered handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the loop to stop after the current iteration.
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether a stop was requested.
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless a stop is requested first.
    pub async fn sleep(&self, duration: Duration) {
        let mut notified = pin!(self.inner.notify.notified());
        notified.as_mut().enable();
        if self.is_requested() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = notified => {}
        }
    }
}

/// What one iteration did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// Zero-based iteration number.
    pub iteration: u64,
    /// Whether a checkpoint was written at the start.
    pub checkpointed: bool,
    /// Crawl ticks run before scoring.
    pub ticks: usize,
    /// Pages and images accepted across all ticks.
    pub discoveries: Discoveries,
    /// Scoring results.
    pub scoring: PassSummary,
    /// Frontier sizes after scoring.
    pub stats: FrontierStats,
}

impl IterationReport {
    /// No pages left to fetch and no images left to score.
    pub fn is_exhausted(&self) -> bool {
        self.stats.is_exhausted()
    }
}

/// Crawl and score stages bound to one store, plus the loop that repeats them.
pub struct Pipeline {
    store: Arc<FrontierStore>,
    scheduler: CrawlScheduler,
    scoring: ScoringLoop,
    controls: CrawlControls,
    metrics: Arc<Metrics>,
    shutdown: Shutdown,
}

impl Pipeline {
    /// Wires every stage around `store`.
    pub fn new(
        store: Arc<FrontierStore>,
        fetcher: Arc<dyn Fetcher>,
        oracle: Arc<dyn FaceOracle>,
        reference: Vec<f32>,
        output: OutputLayout,
        controls: CrawlControls,
        metrics: Arc<Metrics>,
    ) -> Self {
        let extractor = PageExtractor::new(Arc::clone(&fetcher), Arc::clone(&store));
        let scheduler = CrawlScheduler::new(extractor, Arc::clone(&metrics));
        let scoring = ScoringLoop::new(
            Arc::clone(&store),
            fetcher,
            oracle,
            reference,
            output,
            controls.scoring(),
            Arc::clone(&metrics),
        );
        Self {
            store,
            scheduler,
            scoring,
            controls,
            metrics,
            shutdown: Shutdown::new(),
        }
    }

    /// Shared crawl state.
    pub fn store(&self) -> &Arc<FrontierStore> {
        &self.store
    }

    /// Where results are written.
    pub fn output(&self) -> &OutputLayout {
        self.scoring.output()
    }

    /// Handle that stops [`Pipeline::run`].
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Checkpoints when due, crawls until the image queue reaches its high-water
    /// mark or the frontier runs dry, then scores everything queued.
    pub async fn run_iteration(&self, iteration: u64) -> Result<IterationReport, CrawlError> {
        let mut report = IterationReport {
            iteration,
            ..IterationReport::default()
        };

        if iteration % self.controls.checkpoint_every() == 0 {
            self.write_checkpoint().await?;
            report.checkpointed = true;
        }

        let high_water = self.controls.queue_high_water();
        while !self.shutdown.is_requested() {
            if self.store.stats().await.pending_images >= high_water {
                debug!(high_water, "image queue full; pausing link discovery");
                break;
            }
            let tick = self.scheduler.tick(self.controls.concurrency()).await;
            if tick.is_idle() {
                break;
            }
            report.ticks += 1;
            report.discoveries += tick.discoveries;

            let stats = self.store.stats().await;
            info!(
                "new images: {}/{}, new links: {}/{}",
                tick.discoveries.new_images,
                stats.pending_images,
                tick.discoveries.new_links,
                stats.pending_links
            );
        }

        report.scoring = self.scoring.run_pass().await?;
        report.stats = self.store.stats().await;
        Ok(report)
    }

    /// Repeats iterations until shutdown, or until the crawl is exhausted when
    /// configured to exit then. Failed iterations back off and retry; a final
    /// checkpoint is written on the way out.
    pub async fn run(&self) -> Result<u64, CrawlError> {
        let mut backoff = Backoff::new(self.controls.backoff_base(), self.controls.max_backoff());
        let mut iteration = 0u64;

        while !self.shutdown.is_requested() {
            match self.run_iteration(iteration).await {
                Ok(report) => {
                    backoff.reset();
                    debug!(
                        iteration,
                        ticks = report.ticks,
                        scored = report.scoring.scored,
                        promising = report.scoring.promising,
                        "iteration complete"
                    );
                    if report.is_exhausted() {
                        if self.controls.exit_when_exhausted() {
                            info!(iteration, "crawl exhausted; stopping");
                            iteration += 1;
                            break;
                        }
                        debug!("crawl exhausted; idling");
                        self.shutdown.sleep(IDLE_POLL_INTERVAL).await;
                    }
                }
                Err(err) => {
                    self.metrics.record_iteration_failure();
                    let delay = backoff.next_delay();
                    warn!(
                        iteration,
                        failures = backoff.consecutive_failures(),
                        delay_secs = delay.as_secs_f64(),
                        error = %err,
                        "iteration failed; backing off"
                    );
                    self.shutdown.sleep(delay).await;
                }
            }
            iteration += 1;
        }

        self.write_checkpoint().await?;
        Ok(iteration)
    }

    async fn write_checkpoint(&self) -> Result<(), CrawlError> {
        let path = self.controls.state_file();
        self.store.checkpoint(path).await?;
        self.metrics.record_checkpoint();
        debug!(path = %path.display(), "checkpoint written");
        Ok(())
    }
}

/// Sends the reference image through the oracle and keeps the first face's
/// embedding.
pub async fn reference_embedding(
    oracle: &dyn FaceOracle,
    path: &Path,
) -> Result<Vec<f32>, CrawlError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| CrawlError::Reference {
            path: path.to_path_buf(),
            source,
        })?;
    oracle
        .detect(&bytes)
        .await?
        .into_iter()
        .next()
        .map(|face| face.embedding)
        .ok_or_else(|| CrawlError::NoReferenceFace(path.to_path_buf()))
}

/// Builds the runtime and runs the crawl described by `controls` until stopped.
pub fn run(controls: CrawlControls) -> Result<(), CrawlError> {
    #[cfg(feature = "multi_thread")]
    let rt = Builder::new_multi_thread().enable_all().build();
    #[cfg(not(feature = "multi_thread"))]
    let rt = Builder::new_current_thread().enable_all().build();

    rt.map_err(CrawlError::Runtime)?.block_on(run_async(controls))
}

async fn run_async(controls: CrawlControls) -> Result<(), CrawlError> {
    let start = Instant::now();
    let metrics = Arc::new(Metrics::default());

    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(
        controls.page_timeout(),
        controls.image_timeout(),
    )?);
    let oracle: Arc<dyn FaceOracle> = Arc::new(RemoteFaceOracle::new(
        controls.oracle_url(),
        controls.model(),
        controls.page_timeout(),
    )?);

    let store = if controls.restore() {
        let store = FrontierStore::restore(controls.state_file()).await?;
        let stats = store.stats().await;
        info!(
            path = %controls.state_file().display(),
            visited = stats.visited,
            pending_links = stats.pending_links,
            pending_images = stats.pending_images,
            "restored crawl state"
        );
        store
    } else {
        FrontierStore::seeded(controls.domain())?
    };

    let reference = reference_embedding(oracle.as_ref(), controls.reference_image()).await?;
    let output = OutputLayout::create_run_dir(controls.output_parent())?;
    info!(output = %output.root().display(), domain = controls.domain(), "starting crawl");

    let pipeline = Pipeline::new(
        Arc::new(store),
        fetcher,
        oracle,
        reference,
        output,
        controls,
        Arc::clone(&metrics),
    );

    let shutdown = pipeline.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing current iteration");
            shutdown.request();
        }
    });

    let iterations = pipeline.run().await;
    metrics.report(start.elapsed());
    let iterations = iterations?;
    info!(iterations, "crawl stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face, planar, png, ScriptedOracle, StaticWeb};

    struct Fixture {
        pipeline: Pipeline,
        metrics: Arc<Metrics>,
        dir: tempfile::TempDir,
    }

    fn fixture(
        web: StaticWeb,
        oracle: ScriptedOracle,
        tweak: impl FnOnce(CrawlControls) -> CrawlControls,
    ) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let controls = tweak(
            CrawlControls::for_domain("https://example.com/", dir.path().to_path_buf())
                .with_checkpoints(dir.path().join("state.txt"), 1),
        );
        let metrics = Arc::new(Metrics::default());
        let pipeline = Pipeline::new(
            Arc::new(FrontierStore::seeded(controls.domain()).expect("seed")),
            Arc::new(web),
            Arc::new(oracle),
            planar(0.0),
            OutputLayout::create_run_dir(dir.path()).expect("layout"),
            controls,
            Arc::clone(&metrics),
        );
        Fixture {
            pipeline,
            metrics,
            dir,
        }
    }

    #[test]
    fn backoff_grows_and_resets() {
        let mut backoff = Backoff::new(1.2, Duration::from_secs(600));
        let delays: Vec<Duration> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!((delays[2].as_secs_f64() - 1.44).abs() < 1e-9);
        assert_eq!(backoff.consecutive_failures(), 6);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_is_capped() {
        let mut backoff = Backoff::new(2.0, Duration::from_secs(10));
        let delays: Vec<Duration> = (0..40).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays[3], Duration::from_secs(8));
        assert!(delays[4..].iter().all(|delay| *delay == Duration::from_secs(10)));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn shutdown_interrupts_sleep() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.sleep(Duration::from_secs(3600)).await })
        };
        tokio::task::yield_now().await;
        shutdown.request();
        waiter.await.expect("join");
        assert!(shutdown.is_requested());
        shutdown.sleep(Duration::from_secs(3600)).await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn iteration_crawls_scores_and_checkpoints() {
        let portrait = png(8, 8, 7);
        let web = StaticWeb::new()
            .with_page(
                "https://example.com/",
                r#"<a href="/a">a</a><img src="/me.jpg"><a href="/b">b</a>"#,
            )
            .with_page("https://example.com/a", r#"<img src="/me.jpg"><img src="/other.png">"#)
            .with_page("https://example.com/b", "<p>nothing</p>")
            .with_image("https://example.com/me.jpg", portrait.clone());
        let oracle = ScriptedOracle::new()
            .with_faces(&portrait, vec![face(planar(5.0), 1.0, 1.0, 5.0, 5.0)]);
        let fx = fixture(web, oracle, |c| c.with_concurrency(2));

        let report = fx.pipeline.run_iteration(0).await.expect("iteration");
        assert!(report.checkpointed);
        assert_eq!(report.ticks, 2);
        assert_eq!(report.discoveries.new_links, 2);
        assert_eq!(report.discoveries.new_images, 2);
        assert_eq!(report.scoring.attempted, 2);
        assert_eq!(report.scoring.promising, 1);
        assert!(report.is_exhausted());
        assert!(fx.dir.path().join("state.txt").exists());
        assert_eq!(fx.metrics.snapshot().checkpoints_written, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn high_water_mark_pauses_discovery() {
        let web = StaticWeb::new()
            .with_page("https://example.com/", r#"<img src="/1.png"><a href="/next">n</a>"#)
            .with_page("https://example.com/next", r#"<img src="/2.png">"#);
        let fx = fixture(web, ScriptedOracle::new(), |c| {
            c.with_queue_high_water(1).with_checkpoints(PathBuf::from("unused"), 1000)
        });

        let report = fx.pipeline.run_iteration(1).await.expect("iteration");
        assert!(!report.checkpointed);
        assert_eq!(report.ticks, 1);
        assert_eq!(report.stats.pending_links, 1);
        assert!(!report.is_exhausted());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn run_backs_off_on_oracle_failure_then_exits_when_exhausted() {
        let broken = png(8, 8, 9);
        let web = StaticWeb::new()
            .with_page("https://example.com/", r#"<img src="/x.png">"#)
            .with_image("https://example.com/x.png", broken.clone());
        let oracle = ScriptedOracle::new().failing_on(&broken);
        let fx = fixture(web, oracle, |c| {
            c.with_exit_when_exhausted(true)
                .with_backoff(1.2, Duration::from_secs(5))
        });

        let iterations = fx.pipeline.run().await.expect("run");
        assert_eq!(iterations, 2);
        let snap = fx.metrics.snapshot();
        assert_eq!(snap.iteration_failures, 1);
        assert_eq!(snap.checkpoints_written, 3);
        assert!(fx.pipeline.store().stats().await.is_exhausted());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_stops_immediately_when_shutdown_requested() {
        let fx = fixture(StaticWeb::new(), ScriptedOracle::new(), |c| c);
        fx.pipeline.shutdown_handle().request();
        assert_eq!(fx.pipeline.run().await.expect("run"), 0);
        assert_eq!(fx.metrics.snapshot().checkpoints_written, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reference_uses_first_face() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("me.png");
        let bytes = png(4, 4, 1);
        std::fs::write(&path, &bytes).expect("write");

        let oracle = ScriptedOracle::new().with_faces(
            &bytes,
            vec![face(planar(30.0), 0.0, 0.0, 1.0, 1.0), face(planar(60.0), 0.0, 0.0, 1.0, 1.0)],
        );
        let embedding = reference_embedding(&oracle, &path).await.expect("reference");
        assert_eq!(embedding, planar(30.0));

        let blank = ScriptedOracle::new();
        let err = reference_embedding(&blank, &path).await.unwrap_err();
        assert!(matches!(err, CrawlError::NoReferenceFace(_)));

        let err = reference_embedding(&oracle, &dir.path().join("absent.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Reference { .. }));
    }
}
