#![warn(missing_docs)]
//! Core library entry points for the facecrawl crawler.

pub mod checkpoint;
pub mod controls;
pub mod fetch;
pub mod frontier;
pub mod html;
pub mod metrics;
pub mod oracle;
pub mod output;
pub mod page;
pub mod runtime;
pub mod scheduler;
pub mod scoring;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use checkpoint::CheckpointError;
pub use controls::{Cli, ConfigError, CrawlControls};
pub use fetch::{FetchError, Fetcher, HttpFetcher, PageResponse};
pub use frontier::{CrawlState, Discoveries, FrontierError, FrontierStats, FrontierStore, ImageTask};
pub use html::{extract_references, PageReferences};
pub use metrics::{Metrics, MetricsSnapshot};
pub use oracle::{cosine_similarity, DetectedFace, FaceOracle, OracleError, RemoteFaceOracle};
pub use output::{MatchRecord, OutputError, OutputLayout};
pub use page::PageExtractor;
pub use runtime::{run as run_crawler, Backoff, CrawlError, IterationReport, Pipeline, Shutdown};
pub use scheduler::{CrawlScheduler, TickReport};
pub use scoring::{PassSummary, ScoringConfig, ScoringError, ScoringLoop};
