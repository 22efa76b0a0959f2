use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("malformed embedding value at position {index}: {token:?}")]
    Malformed { index: usize, token: String },
    #[error("non-finite embedding value at position {index}")]
    NonFinite { index: usize },
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for the bundled ArcFace model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Embeddings of different lengths are not comparable.
    pub fn euclidean_distance(&self, other: &Embedding) -> Result<f32, EmbeddingError> {
        if self.values.len() != other.values.len() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.values.len(),
                actual: other.values.len(),
            });
        }

        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }

    /// Check the invariants every stored embedding satisfies: exactly
    /// `expected_dim` values, all finite.
    pub fn validate(&self, expected_dim: usize) -> Result<(), EmbeddingError> {
        if self.values.len() != expected_dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: expected_dim,
                actual: self.values.len(),
            });
        }
        match self.values.iter().position(|v| !v.is_finite()) {
            Some(index) => Err(EmbeddingError::NonFinite { index }),
            None => Ok(()),
        }
    }

    /// Canonical storage form: comma-joined shortest round-trip decimals.
    pub fn to_csv(&self) -> String {
        let parts: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
        parts.join(",")
    }

    /// Parse the canonical storage form, rejecting anything that is not
    /// exactly `expected_dim` finite numbers.
    pub fn from_csv(raw: &str, expected_dim: usize) -> Result<Self, EmbeddingError> {
        let mut values = Vec::with_capacity(expected_dim);
        if !raw.trim().is_empty() {
            for (index, token) in raw.split(',').enumerate() {
                let value: f32 = token.trim().parse().map_err(|_| EmbeddingError::Malformed {
                    index,
                    token: token.to_string(),
                })?;
                if !value.is_finite() {
                    return Err(EmbeddingError::Malformed {
                        index,
                        token: token.to_string(),
                    });
                }
                values.push(value);
            }
        }

        if values.len() != expected_dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: expected_dim,
                actual: values.len(),
            });
        }

        Ok(Self { values })
    }
}

/// A face found in an image together with its embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// A registered embedding, keyed by the identity it belongs to.
#[derive(Debug, Clone)]
pub struct FaceTemplate {
    pub identity_id: String,
    pub embedding: Embedding,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the closest template, `f32::INFINITY` for an empty gallery.
    pub distance: f32,
    /// Identity of the matched template (if any).
    pub identity_id: Option<String>,
    /// Another template also fell under the threshold.
    pub ambiguous: bool,
}

/// Strategy for comparing a probe embedding against a gallery of registered faces.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[FaceTemplate],
        threshold: f32,
    ) -> Result<MatchResult, EmbeddingError>;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// Visits every gallery entry; a match requires the best distance to be
/// strictly below the threshold.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[FaceTemplate],
        threshold: f32,
    ) -> Result<MatchResult, EmbeddingError> {
        let mut best_dist = f32::INFINITY;
        let mut runner_up = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, template) in gallery.iter().enumerate() {
            let dist = probe.euclidean_distance(&template.embedding)?;
            if dist < best_dist {
                runner_up = best_dist;
                best_dist = dist;
                best_idx = Some(i);
            } else if dist < runner_up {
                runner_up = dist;
            }
        }

        Ok(match best_idx {
            Some(idx) if best_dist < threshold => MatchResult {
                matched: true,
                distance: best_dist,
                identity_id: Some(gallery[idx].identity_id.clone()),
                ambiguous: runner_up < threshold,
            },
            _ => MatchResult {
                matched: false,
                distance: best_dist,
                identity_id: None,
                ambiguous: false,
            },
        })
    }
}
