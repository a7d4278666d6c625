//! In-memory collaborators for exercising the pipeline without a network or model.

use crate::fetch::{FetchError, Fetcher, PageResponse};
use crate::oracle::{BoundingBox, DetectedFace, FaceOracle, OracleError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A fixed set of pages and images served from memory.
#[derive(Default)]
pub struct StaticWeb {
    pages: HashMap<String, PageResponse>,
    images: HashMap<String, Bytes>,
    latency: Duration,
    requests: AtomicUsize,
}

impl StaticWeb {
    /// Creates an empty web.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `html` with status 200 at `url`.
    pub fn with_page(self, url: &str, html: &str) -> Self {
        self.with_response(url, 200, Some("text/html"), html.as_bytes())
    }

    /// Serves an arbitrary response at `url`.
    pub fn with_response(
        mut self,
        url: &str,
        status: u16,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Self {
        self.pages.insert(
            url.to_string(),
            PageResponse {
                url: url.to_string(),
                status,
                content_type: content_type.map(str::to_string),
                body: Bytes::copy_from_slice(body),
            },
        );
        self
    }

    /// Serves raw bytes at `url`.
    pub fn with_image(mut self, url: &str, bytes: impl Into<Bytes>) -> Self {
        self.images.insert(url.to_string(), bytes.into());
        self
    }

    /// Delays every response by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of requests served so far, including misses.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Fetcher for StaticWeb {
    async fn get_page(&self, url: &str) -> Result<PageResponse, FetchError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(url.to_string()))
    }

    async fn get_image_bytes(&self, url: &str) -> Result<Bytes, FetchError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        self.images
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(url.to_string()))
    }
}

/// Oracle that returns pre-recorded faces keyed by the image bytes it receives.
#[derive(Default)]
pub struct ScriptedOracle {
    faces: Mutex<HashMap<Vec<u8>, Vec<DetectedFace>>>,
    failing: Mutex<Vec<Vec<u8>>>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    /// Creates an oracle that detects nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `faces` whenever `image` is submitted.
    pub fn with_faces(self, image: &[u8], faces: Vec<DetectedFace>) -> Self {
        self.faces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(image.to_vec(), faces);
        self
    }

    /// Fails whenever `image` is submitted.
    pub fn failing_on(self, image: &[u8]) -> Self {
        self.failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(image.to_vec());
        self
    }

    /// Number of `detect` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FaceOracle for ScriptedOracle {
    async fn detect(&self, image: &[u8]) -> Result<Vec<DetectedFace>, OracleError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|bytes| bytes.as_slice() == image);
        if failing {
            return Err(OracleError::Backend("scripted failure".into()));
        }
        Ok(self
            .faces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(image)
            .cloned()
            .unwrap_or_default())
    }
}

/// A face whose box covers `(x1, y1)`..`(x2, y2)`.
pub fn face(embedding: Vec<f32>, x1: f32, y1: f32, x2: f32, y2: f32) -> DetectedFace {
    DetectedFace {
        bbox: BoundingBox { x1, y1, x2, y2 },
        embedding,
    }
}

/// Unit vector at `degrees` in the plane; its cosine against `[1, 0]` is `cos(degrees)`.
pub fn planar(degrees: f32) -> Vec<f32> {
    let radians = degrees.to_radians();
    vec![radians.cos(), radians.sin()]
}

/// Encodes a solid-colour PNG of the given size.
///
/// `shade` varies the pixel colour so distinct images produce distinct bytes.
pub fn png(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([shade, 64, 128]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap_or_else(|err| panic!("encoding test png: {err}"));
    out.into_inner()
}
