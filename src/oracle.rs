//! Face detection and embedding similarity.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Face-analysis models a remote backend may be asked to use.
pub const KNOWN_MODELS: &[&str] = &["buffalo_l", "buffalo_m", "buffalo_s", "buffalo_sc"];

/// Pixel-space box around a detected face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// Left edge.
    pub x1: f32,
    /// Top edge.
    pub y1: f32,
    /// Right edge.
    pub x2: f32,
    /// Bottom edge.
    pub y2: f32,
}

/// A face found by the oracle.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    /// Where the face is.
    pub bbox: BoundingBox,
    /// Fixed-length identity embedding.
    pub embedding: Vec<f32>,
}

/// Failure inside a face-analysis backend.
#[derive(Debug, Error)]
pub enum OracleError {
    /// The backend could not be reached.
    #[error("face oracle request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The backend rejected the request.
    #[error("face oracle returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
    /// Any other backend-specific failure.
    #[error("face oracle error: {0}")]
    Backend(String),
}

/// Detects faces and compares embeddings.
///
/// Callers must not invoke `detect` concurrently on the same oracle.
#[async_trait]
pub trait FaceOracle: Send + Sync {
    /// Returns every face in the encoded image; possibly none.
    async fn detect(&self, image: &[u8]) -> Result<Vec<DetectedFace>, OracleError>;

    /// Similarity of two embeddings, `None` when it is undefined.
    fn similarity(&self, a: &[f32], b: &[f32]) -> Option<f32> {
        cosine_similarity(a, b)
    }
}

/// Cosine similarity: the dot product over the product of L2 norms.
///
/// Returns `None` for empty vectors, vectors of different lengths, or either
/// vector having zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b)
        .fold((0.0f64, 0.0f64, 0.0f64), |(dot, na, nb), (&x, &y)| {
            let (x, y) = (f64::from(x), f64::from(y));
            (dot + x * y, na + x * x, nb + y * y)
        });
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return None;
    }
    Some((dot / denom) as f32)
}

/// [`FaceOracle`] that delegates to an HTTP face-analysis service.
///
/// The service receives the raw image as `application/octet-stream` and answers
/// `{"faces": [{"bbox": [x1, y1, x2, y2], "embedding": [...]}]}`.
#[derive(Clone)]
pub struct RemoteFaceOracle {
    client: Client,
    endpoint: String,
    model: String,
}

impl RemoteFaceOracle {
    /// Builds a client for `endpoint` using `model`.
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> Result<Self, OracleError> {
        if endpoint.trim().is_empty() {
            return Err(OracleError::Backend("missing oracle endpoint".into()));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl FaceOracle for RemoteFaceOracle {
    async fn detect(&self, image: &[u8]) -> Result<Vec<DetectedFace>, OracleError> {
        let response = self
            .client
            .post(format!("{}/detect", self.endpoint))
            .query(&[("model", self.model.as_str())])
            .header(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))
            .body(image.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(OracleError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: DetectResponse = response.json().await?;
        Ok(parsed.into_faces())
    }
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    faces: Vec<WireFace>,
}

#[derive(Debug, Deserialize)]
struct WireFace {
    bbox: [f32; 4],
    embedding: Vec<f32>,
}

impl DetectResponse {
    fn into_faces(self) -> Vec<DetectedFace> {
        self.faces
            .into_iter()
            .map(|face| {
                let [x1, y1, x2, y2] = face.bbox;
                DetectedFace {
                    bbox: BoundingBox { x1, y1, x2, y2 },
                    embedding: face.embedding,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn similarity_is_symmetric() {
        let a = [0.3, -1.2, 4.0, 0.5];
        let b = [2.0, 0.1, -0.7, 1.5];
        let ab = cosine_similarity(&a, &b).expect("defined");
        let ba = cosine_similarity(&b, &a).expect("defined");
        assert_eq!(ab, ba);
    }

    #[test]
    fn self_similarity_is_one() {
        for v in [vec![1.0, 0.0], vec![0.3, -1.2, 4.0], vec![1e-3; 512]] {
            let s = cosine_similarity(&v, &v).expect("defined");
            assert!(close(s, 1.0), "got {s}");
        }
    }

    #[test]
    fn orthogonal_and_opposite_vectors() {
        assert!(close(cosine_similarity(&[1.0, 0.0], &[0.0, 2.0]).unwrap(), 0.0));
        assert!(close(cosine_similarity(&[1.0, 1.0], &[-3.0, -3.0]).unwrap(), -1.0));
    }

    #[test]
    fn degenerate_inputs_are_undefined() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), None);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[0.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[], &[]), None);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), None);
    }

    #[test]
    fn parses_detect_response() {
        let body = r#"{"faces":[{"bbox":[1.5,2,30,40.25],"embedding":[0.1,0.2]}]}"#;
        let parsed: DetectResponse = serde_json::from_str(body).expect("json");
        let faces = parsed.into_faces();
        assert_eq!(faces.len(), 1);
        assert_eq!(
            faces[0].bbox,
            BoundingBox {
                x1: 1.5,
                y1: 2.0,
                x2: 30.0,
                y2: 40.25
            }
        );
        assert_eq!(faces[0].embedding, vec![0.1, 0.2]);

        let empty: DetectResponse = serde_json::from_str("{}").expect("json");
        assert!(empty.into_faces().is_empty());
    }

    #[test]
    fn remote_oracle_requires_endpoint() {
        assert!(RemoteFaceOracle::new(" ", "buffalo_sc", Duration::from_secs(1)).is_err());
    }
}
