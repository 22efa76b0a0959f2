//! Test doubles: a text-driven analyzer and a fully wired in-memory service.

use std::path::PathBuf;

use rollcall_core::{AnalyzerError, BoundingBox, Embedding, FaceAnalyzer, FaceScan};

use crate::engine::{spawn_engine, BoxedAnalyzer};
use crate::service::{AttendanceService, MatchSettings};
use crate::store::Store;

pub const TEST_DIM: usize = 3;

/// Reads the "image" as text: faces separated by `|`, each face a
/// comma-separated embedding. An empty image has no faces. Values are only
/// parsed for a lone face, so `1,0,0|junk` still counts as two faces.
pub struct StubAnalyzer;

impl FaceAnalyzer for StubAnalyzer {
    fn analyze(&mut self, image: &[u8]) -> Result<FaceScan, AnalyzerError> {
        let text = std::str::from_utf8(image)
            .map_err(|e| AnalyzerError::InferenceFailed(e.to_string()))?;
        let segments: Vec<&str> = if text.trim().is_empty() {
            Vec::new()
        } else {
            text.split('|').collect()
        };

        let boxes = (0..segments.len())
            .map(|i| BoundingBox {
                x: i as f32 * 100.0,
                y: 0.0,
                width: 80.0,
                height: 80.0,
                confidence: 0.99,
                landmarks: None,
            })
            .collect();

        FaceScan::from_detections(boxes, |_| {
            let values = text
                .split(',')
                .map(|v| v.trim().parse::<f32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AnalyzerError::InferenceFailed(e.to_string()))?;
            Ok(Embedding::new(values))
        })
    }
}

/// Encode faces in the format `StubAnalyzer` reads.
pub fn face_image(faces: &[&[f32]]) -> Vec<u8> {
    faces
        .iter()
        .map(|f| f.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(","))
        .collect::<Vec<_>>()
        .join("|")
        .into_bytes()
}

/// Service over the stub analyzer and an in-memory store. The returned
/// directory is the upload staging area; keep it alive for the test.
pub async fn test_service() -> (AttendanceService, tempfile::TempDir) {
    let uploads = tempfile::tempdir().unwrap();
    let engine = spawn_engine(|| Ok(Box::new(StubAnalyzer) as BoxedAnalyzer)).unwrap();
    let store = Store::open_in_memory(TEST_DIM).await.unwrap();
    let settings = MatchSettings {
        match_threshold: 0.5,
        duplicate_threshold: 0.5,
        embedding_dim: TEST_DIM,
    };
    let service = AttendanceService::new(engine, store, settings, PathBuf::from(uploads.path()));
    (service, uploads)
}

/// Number of files left in the upload staging area.
pub fn staged_files(dir: &tempfile::TempDir) -> usize {
    std::fs::read_dir(dir.path()).map(|d| d.count()).unwrap_or(0)
}
