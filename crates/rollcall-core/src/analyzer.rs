//! Face analysis capability: image bytes in, a [`FaceScan`] out.
//!
//! The matcher never depends on a concrete model. Anything that can find
//! faces in an encoded image implements [`FaceAnalyzer`]. Only a lone face
//! is ever embedded; the face count decides before any per-face work.

use crate::types::{BoundingBox, DetectedFace, Embedding};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("model file not found: {0}: download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces detected ({0})")]
    MultipleFacesDetected(usize),
}

/// What an analyzer found in one image.
#[derive(Debug, Clone)]
pub enum FaceScan {
    NoFace,
    Single(DetectedFace),
    /// Every face found. None of them was embedded.
    Multiple(Vec<BoundingBox>),
}

impl FaceScan {
    /// Classify detections by count and run `embed` only for a lone face.
    ///
    /// The embedding must come back finite; anything else is an inference
    /// failure, never a face.
    pub fn from_detections<F>(mut boxes: Vec<BoundingBox>, embed: F) -> Result<Self, AnalyzerError>
    where
        F: FnOnce(&BoundingBox) -> Result<Embedding, AnalyzerError>,
    {
        if boxes.len() > 1 {
            return Ok(FaceScan::Multiple(boxes));
        }
        let Some(bbox) = boxes.pop() else {
            return Ok(FaceScan::NoFace);
        };

        let embedding = embed(&bbox)?;
        if let Some(index) = embedding.values.iter().position(|v| !v.is_finite()) {
            return Err(AnalyzerError::InferenceFailed(format!(
                "embedding has a non-finite value at position {index}"
            )));
        }
        Ok(FaceScan::Single(DetectedFace { bbox, embedding }))
    }

    pub fn face_count(&self) -> usize {
        match self {
            FaceScan::NoFace => 0,
            FaceScan::Single(_) => 1,
            FaceScan::Multiple(boxes) => boxes.len(),
        }
    }
}

/// Turns an encoded image (JPEG, PNG, ...) into a [`FaceScan`].
pub trait FaceAnalyzer {
    fn analyze(&mut self, image: &[u8]) -> Result<FaceScan, AnalyzerError>;
}

impl<T: FaceAnalyzer + ?Sized> FaceAnalyzer for Box<T> {
    fn analyze(&mut self, image: &[u8]) -> Result<FaceScan, AnalyzerError> {
        (**self).analyze(image)
    }
}

/// Accept exactly one face. Captures with several faces are rejected
/// outright rather than resolved per face.
pub fn require_single_face(scan: FaceScan) -> Result<DetectedFace, GateError> {
    match scan {
        FaceScan::NoFace => Err(GateError::NoFaceDetected),
        FaceScan::Single(face) => Ok(face),
        FaceScan::Multiple(boxes) => Err(GateError::MultipleFacesDetected(boxes.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32) -> BoundingBox {
        BoundingBox {
            x,
            y: 0.0,
            width: 10.0,
            height: 10.0,
            confidence: 0.9,
            landmarks: None,
        }
    }

    fn embed_x(b: &BoundingBox) -> Result<Embedding, AnalyzerError> {
        Ok(Embedding::new(vec![b.x, 0.0]))
    }

    #[test]
    fn test_gate_rejects_empty() {
        let scan = FaceScan::from_detections(Vec::new(), embed_x).unwrap();
        assert_eq!(scan.face_count(), 0);
        assert_eq!(
            require_single_face(scan).unwrap_err(),
            GateError::NoFaceDetected
        );
    }

    #[test]
    fn test_gate_accepts_single() {
        let scan = FaceScan::from_detections(vec![bbox(1.0)], embed_x).unwrap();
        let accepted = require_single_face(scan).unwrap();
        assert_eq!(accepted.embedding.values, vec![1.0, 0.0]);
    }

    #[test]
    fn test_multiple_faces_are_never_embedded() {
        let scan = FaceScan::from_detections(vec![bbox(1.0), bbox(2.0)], |_| {
            Err(AnalyzerError::InferenceFailed("degenerate landmarks".into()))
        })
        .unwrap();
        assert_eq!(scan.face_count(), 2);
        assert_eq!(
            require_single_face(scan).unwrap_err(),
            GateError::MultipleFacesDetected(2)
        );
    }

    #[test]
    fn test_non_finite_embedding_is_inference_failure() {
        let err = FaceScan::from_detections(vec![bbox(1.0)], |_| {
            Ok(Embedding::new(vec![0.1, f32::NAN]))
        })
        .unwrap_err();
        assert!(matches!(err, AnalyzerError::InferenceFailed(_)));
    }

    struct Fixed(usize);

    impl FaceAnalyzer for Fixed {
        fn analyze(&mut self, _image: &[u8]) -> Result<FaceScan, AnalyzerError> {
            let boxes = (0..self.0).map(|i| bbox(i as f32)).collect();
            FaceScan::from_detections(boxes, embed_x)
        }
    }

    #[test]
    fn test_boxed_analyzer_delegates() {
        let mut boxed: Box<dyn FaceAnalyzer> = Box::new(Fixed(3));
        assert_eq!(boxed.analyze(b"img").unwrap().face_count(), 3);
    }
}
