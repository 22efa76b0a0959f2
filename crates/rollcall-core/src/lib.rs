//! rollcall-core: face matching for attendance tracking.
//!
//! Embeddings and the Euclidean match decision live in [`types`]. Face
//! analysis is a capability ([`FaceAnalyzer`]); the bundled implementation
//! runs SCRFD detection and ArcFace recognition through ONNX Runtime.

pub mod align;
pub mod analyzer;
pub mod onnx;
pub mod types;

use std::path::PathBuf;

pub use analyzer::{require_single_face, AnalyzerError, FaceAnalyzer, FaceScan, GateError};
pub use onnx::OnnxAnalyzer;
pub use types::{
    BoundingBox, DetectedFace, Embedding, EmbeddingError, EuclideanMatcher, FaceTemplate,
    MatchResult, Matcher,
};

/// Default acceptance threshold on Euclidean distance. Shared by attendance
/// matching and the registration duplicate guard.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Default embedding dimension (ArcFace w600k_r50).
pub const DEFAULT_EMBEDDING_DIM: usize = onnx::ARCFACE_EMBEDDING_DIM;

/// Model directory used when none is configured: `$XDG_DATA_HOME/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}
