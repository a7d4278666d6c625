//! Command-line surface and the validated controls derived from it.

use crate::oracle::KNOWN_MODELS;
use crate::scoring::ScoringConfig;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Startup validation failures. These are the only fatal errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The domain is not a usable crawl origin.
    #[error(
        "invalid domain {0}: expected something like https://www.example.com or https://sub.example.com"
    )]
    InvalidDomain(String),
    /// The reference face image does not exist.
    #[error("reference image {} does not exist", .0.display())]
    MissingReference(PathBuf),
    /// The output parent directory does not exist.
    #[error("output directory {} does not exist", .0.display())]
    MissingOutput(PathBuf),
    /// A numeric knob is outside its valid range.
    #[error("{name} {reason}")]
    OutOfRange {
        /// Flag name.
        name: &'static str,
        /// Constraint that was violated.
        reason: &'static str,
    },
    /// The model is not one the oracle backends know.
    #[error("unknown model {0}; expected one of buffalo_l, buffalo_m, buffalo_s, buffalo_sc")]
    UnknownModel(String),
}

/// Immutable, validated crawl settings.
#[derive(Clone, Debug, PartialEq)]
pub struct CrawlControls {
    domain: String,
    reference_image: PathBuf,
    output_parent: PathBuf,
    oracle_url: String,
    model: String,
    concurrency: usize,
    queue_high_water: usize,
    scoring: ScoringConfig,
    restore: bool,
    state_file: PathBuf,
    checkpoint_every: u64,
    page_timeout: Duration,
    image_timeout: Duration,
    backoff_base: f64,
    max_backoff: Duration,
    exit_when_exhausted: bool,
}

impl CrawlControls {
    /// Starting URL of the crawl.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Image holding the face to look for.
    pub fn reference_image(&self) -> &PathBuf {
        &self.reference_image
    }

    /// Directory under which the run directory is created.
    pub fn output_parent(&self) -> &PathBuf {
        &self.output_parent
    }

    /// Face-analysis service endpoint.
    pub fn oracle_url(&self) -> &str {
        &self.oracle_url
    }

    /// Face-analysis model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Pages fetched per tick.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Queue length at which link discovery pauses.
    pub fn queue_high_water(&self) -> usize {
        self.queue_high_water
    }

    /// Scoring threshold, save-all flag, and download fan-out.
    pub fn scoring(&self) -> ScoringConfig {
        self.scoring
    }

    /// Whether to resume from the state file.
    pub fn restore(&self) -> bool {
        self.restore
    }

    /// Checkpoint location.
    pub fn state_file(&self) -> &PathBuf {
        &self.state_file
    }

    /// Iterations between checkpoints.
    pub fn checkpoint_every(&self) -> u64 {
        self.checkpoint_every
    }

    /// Timeout for page fetches.
    pub fn page_timeout(&self) -> Duration {
        self.page_timeout
    }

    /// Timeout for image downloads.
    pub fn image_timeout(&self) -> Duration {
        self.image_timeout
    }

    /// Base of the exponential backoff, in seconds.
    pub fn backoff_base(&self) -> f64 {
        self.backoff_base
    }

    /// Upper bound on a single backoff sleep.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Whether to stop once there is no work left.
    pub fn exit_when_exhausted(&self) -> bool {
        self.exit_when_exhausted
    }

    /// Controls for embedding the pipeline directly, bypassing the CLI checks.
    pub fn for_domain(domain: &str, output_parent: PathBuf) -> Self {
        Self {
            domain: domain.to_string(),
            reference_image: PathBuf::new(),
            output_parent,
            oracle_url: String::new(),
            model: "buffalo_sc".to_string(),
            concurrency: 20,
            queue_high_water: 1000,
            scoring: ScoringConfig::default(),
            restore: false,
            state_file: PathBuf::from("state.txt"),
            checkpoint_every: 10,
            page_timeout: Duration::from_secs(10),
            image_timeout: Duration::from_secs(3),
            backoff_base: 1.2,
            max_backoff: Duration::from_secs(600),
            exit_when_exhausted: false,
        }
    }

    /// Overrides the tick size.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Overrides the image-queue high-water mark.
    pub fn with_queue_high_water(mut self, queue_high_water: usize) -> Self {
        self.queue_high_water = queue_high_water;
        self
    }

    /// Overrides scoring settings.
    pub fn with_scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = scoring;
        self
    }

    /// Overrides checkpoint location and cadence.
    pub fn with_checkpoints(mut self, state_file: PathBuf, every: u64) -> Self {
        self.state_file = state_file;
        self.checkpoint_every = every.max(1);
        self
    }

    /// Overrides the backoff schedule.
    pub fn with_backoff(mut self, base: f64, max: Duration) -> Self {
        self.backoff_base = base;
        self.max_backoff = max;
        self
    }

    /// Stops the run once both queues are empty.
    pub fn with_exit_when_exhausted(mut self, exit: bool) -> Self {
        self.exit_when_exhausted = exit;
        self
    }
}

/// Command-line interface for the crawler binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "facecrawl", about = "Search a domain for images similar to a reference face")]
pub struct Cli {
    /// Domain to crawl, e.g. https://www.example.com
    #[arg(long, env = "FACECRAWL_DOMAIN")]
    pub domain: String,

    /// Image containing the face to look for
    #[arg(long, env = "FACECRAWL_INPUT")]
    pub input: PathBuf,

    /// Directory in which the run's output folder is created
    #[arg(long, env = "FACECRAWL_OUTPUT", default_value = "./")]
    pub output: PathBuf,

    /// Face-analysis service endpoint
    #[arg(long, env = "FACECRAWL_ORACLE_URL", default_value = "http://127.0.0.1:8000")]
    pub oracle_url: String,

    /// Face-analysis model
    #[arg(long, env = "FACECRAWL_MODEL", default_value = "buffalo_sc")]
    pub model: String,

    /// Pages fetched concurrently per tick
    #[arg(long, env = "FACECRAWL_CONCURRENCY", default_value_t = 20)]
    pub concurrency: usize,

    /// Image queue length above which link discovery pauses
    #[arg(long, env = "FACECRAWL_QUEUE_HIGH_WATER", default_value_t = 1000)]
    pub queue_high_water: usize,

    /// Similarity above which an image is promising
    #[arg(long, env = "FACECRAWL_THRESHOLD", default_value_t = 0.3)]
    pub threshold: f32,

    /// Save every image with a face, not only promising ones
    #[arg(long, env = "FACECRAWL_SAVE_ALL", default_value_t = false)]
    pub save_all: bool,

    /// Resume from the state file
    #[arg(long, env = "FACECRAWL_RESTORE", default_value_t = false)]
    pub restore: bool,

    /// Checkpoint file
    #[arg(long, env = "FACECRAWL_STATE_FILE", default_value = "state.txt")]
    pub state_file: PathBuf,

    /// Iterations between checkpoints
    #[arg(long, env = "FACECRAWL_CHECKPOINT_EVERY", default_value_t = 10)]
    pub checkpoint_every: u64,

    /// Page fetch timeout in seconds
    #[arg(long, env = "FACECRAWL_PAGE_TIMEOUT_SECS", default_value_t = 10)]
    pub page_timeout_secs: u64,

    /// Image download timeout in seconds
    #[arg(long, env = "FACECRAWL_IMAGE_TIMEOUT_SECS", default_value_t = 3)]
    pub image_timeout_secs: u64,

    /// Image downloads kept in flight while scoring
    #[arg(long, env = "FACECRAWL_DOWNLOAD_CONCURRENCY", default_value_t = 8)]
    pub download_concurrency: usize,

    /// Base of the exponential backoff after failed iterations
    #[arg(long, env = "FACECRAWL_BACKOFF_BASE", default_value_t = 1.2)]
    pub backoff_base: f64,

    /// Longest single backoff sleep in seconds
    #[arg(long, env = "FACECRAWL_MAX_BACKOFF_SECS", default_value_t = 600)]
    pub max_backoff_secs: u64,

    /// Stop once every page and image has been processed
    #[arg(long, env = "FACECRAWL_EXIT_WHEN_EXHAUSTED", default_value_t = false)]
    pub exit_when_exhausted: bool,
}

impl Cli {
    /// Validates the parsed flags into `CrawlControls`.
    pub fn build_controls(&self) -> Result<CrawlControls, ConfigError> {
        validate_domain(&self.domain)?;
        if !self.input.is_file() {
            return Err(ConfigError::MissingReference(self.input.clone()));
        }
        if !self.output.is_dir() {
            return Err(ConfigError::MissingOutput(self.output.clone()));
        }
        if !KNOWN_MODELS.contains(&self.model.as_str()) {
            return Err(ConfigError::UnknownModel(self.model.clone()));
        }
        if self.concurrency == 0 {
            return Err(out_of_range("concurrency", "must be at least 1"));
        }
        if self.download_concurrency == 0 {
            return Err(out_of_range("download-concurrency", "must be at least 1"));
        }
        if !(-1.0..=1.0).contains(&self.threshold) {
            return Err(out_of_range("threshold", "must lie within [-1, 1]"));
        }
        if self.checkpoint_every == 0 {
            return Err(out_of_range("checkpoint-every", "must be at least 1"));
        }
        if self.page_timeout_secs == 0 || self.image_timeout_secs == 0 {
            return Err(out_of_range("timeouts", "must be at least one second"));
        }
        if !(self.backoff_base >= 1.0 && self.backoff_base.is_finite()) {
            return Err(out_of_range("backoff-base", "must be a finite number >= 1"));
        }

        Ok(CrawlControls {
            domain: self.domain.trim().to_string(),
            reference_image: self.input.clone(),
            output_parent: self.output.clone(),
            oracle_url: self.oracle_url.clone(),
            model: self.model.clone(),
            concurrency: self.concurrency,
            queue_high_water: self.queue_high_water,
            scoring: ScoringConfig {
                threshold: self.threshold,
                save_all: self.save_all,
                download_concurrency: self.download_concurrency,
            },
            restore: self.restore,
            state_file: self.state_file.clone(),
            checkpoint_every: self.checkpoint_every,
            page_timeout: Duration::from_secs(self.page_timeout_secs),
            image_timeout: Duration::from_secs(self.image_timeout_secs),
            backoff_base: self.backoff_base,
            max_backoff: Duration::from_secs(self.max_backoff_secs.max(1)),
            exit_when_exhausted: self.exit_when_exhausted,
        })
    }
}

fn out_of_range(name: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::OutOfRange { name, reason }
}

/// Accepts http(s) URLs whose host has at least two labels.
pub fn validate_domain(domain: &str) -> Result<Url, ConfigError> {
    let invalid = || ConfigError::InvalidDomain(domain.to_string());
    let url = Url::parse(domain.trim()).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid());
    }
    match url.host_str() {
        Some(host) if host.split('.').filter(|label| !label.is_empty()).count() >= 2 => Ok(url),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(dir: &std::path::Path, extra: &[&str]) -> Cli {
        let input = dir.join("face.jpg");
        std::fs::write(&input, b"jpg").expect("write reference");
        let mut args = vec![
            "facecrawl".to_string(),
            "--domain".into(),
            "https://www.example.com".into(),
            "--input".into(),
            input.display().to_string(),
            "--output".into(),
            dir.display().to_string(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        Cli::try_parse_from(args).expect("parse")
    }

    #[test]
    fn defaults_match_documented_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controls = cli(dir.path(), &[]).build_controls().expect("valid");
        assert_eq!(controls.concurrency(), 20);
        assert_eq!(controls.queue_high_water(), 1000);
        assert_eq!(controls.scoring().threshold, 0.3);
        assert!(!controls.scoring().save_all);
        assert_eq!(controls.checkpoint_every(), 10);
        assert_eq!(controls.image_timeout(), Duration::from_secs(3));
        assert_eq!(controls.backoff_base(), 1.2);
        assert_eq!(controls.model(), "buffalo_sc");
    }

    #[test]
    fn flags_override_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controls = cli(
            dir.path(),
            &["--save-all", "--restore", "--threshold", "0.5", "--concurrency", "4"],
        )
        .build_controls()
        .expect("valid");
        assert!(controls.scoring().save_all);
        assert!(controls.restore());
        assert_eq!(controls.scoring().threshold, 0.5);
        assert_eq!(controls.concurrency(), 4);
    }

    #[test]
    fn rejects_bad_startup_values() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut bad = cli(dir.path(), &[]);
        bad.domain = "example".into();
        assert!(matches!(bad.build_controls(), Err(ConfigError::InvalidDomain(_))));

        let mut bad = cli(dir.path(), &[]);
        bad.input = dir.path().join("absent.jpg");
        assert!(matches!(bad.build_controls(), Err(ConfigError::MissingReference(_))));

        let mut bad = cli(dir.path(), &[]);
        bad.output = dir.path().join("absent");
        assert!(matches!(bad.build_controls(), Err(ConfigError::MissingOutput(_))));

        let bad = cli(dir.path(), &["--concurrency", "0"]);
        assert!(matches!(bad.build_controls(), Err(ConfigError::OutOfRange { .. })));

        let bad = cli(dir.path(), &["--model", "antelope"]);
        assert!(matches!(bad.build_controls(), Err(ConfigError::UnknownModel(_))));
    }

    #[test]
    fn domain_validation() {
        assert!(validate_domain("https://www.example.com").is_ok());
        assert!(validate_domain("http://sub.example.com/start").is_ok());
        assert!(validate_domain("www.example.com").is_err());
        assert!(validate_domain("ftp://example.com").is_err());
        assert!(validate_domain("https://localhost").is_err());
    }
}
