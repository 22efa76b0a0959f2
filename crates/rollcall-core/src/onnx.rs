//! ONNX Runtime face analyzer: SCRFD detection followed by ArcFace embedding.
//!
//! Input images are decoded to RGB, letterboxed into the 640×640 SCRFD input
//! (resized image anchored top-left), decoded over three strides and
//! de-duplicated with NMS. A lone surviving face is aligned on its five
//! landmarks and embedded with ArcFace; photos with several faces are never
//! embedded.

use crate::align::{self, ALIGNED_SIZE};
use crate::analyzer::{AnalyzerError, FaceAnalyzer, FaceScan};
use crate::types::{BoundingBox, Embedding};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Output tensor positions (score, bbox, kps) for one stride.
type StrideOutputs = (usize, usize, usize);

/// SCRFD + ArcFace analyzer. Not reentrant: `analyze` needs `&mut self`.
pub struct OnnxAnalyzer {
    detector: Session,
    recognizer: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl OnnxAnalyzer {
    /// Load both models from a directory holding the InsightFace `buffalo_l` files.
    pub fn load_from_dir(model_dir: &Path) -> Result<Self, AnalyzerError> {
        Self::load(
            &model_dir.join(DETECTOR_MODEL_FILE),
            &model_dir.join(RECOGNIZER_MODEL_FILE),
        )
    }

    pub fn load(detector_path: &Path, recognizer_path: &Path) -> Result<Self, AnalyzerError> {
        let detector = open_session(detector_path)?;
        let num_outputs = detector.outputs().len();
        if num_outputs < 9 {
            return Err(AnalyzerError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }
        let names: Vec<String> = detector.outputs().iter().map(|o| o.name().to_string()).collect();
        let stride_outputs = stride_output_indices(&names);
        tracing::debug!(?stride_outputs, "SCRFD output mapping");
        let recognizer = open_session(recognizer_path)?;

        Ok(Self {
            detector,
            recognizer,
            stride_outputs,
        })
    }

    /// Detect faces, sorted by descending confidence.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
        let (input, scale) = letterbox(image);
        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let tensor = |idx: usize, what: &str| -> Result<Vec<f32>, AnalyzerError> {
                let (_, data) = outputs[idx].try_extract_tensor::<f32>().map_err(|e| {
                    AnalyzerError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                })?;
                Ok(data.to_vec())
            };
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[level];
            let scores = tensor(score_idx, "scores")?;
            let boxes = tensor(bbox_idx, "bboxes")?;
            let kps = tensor(kps_idx, "kps")?;
            candidates.extend(decode_level(&scores, &boxes, &kps, stride, scale));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }

    fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, AnalyzerError> {
        let landmarks = face.landmarks.as_ref().ok_or_else(|| {
            AnalyzerError::InferenceFailed("face has no landmarks for alignment".into())
        })?;
        let aligned = align::align_face(image, landmarks).ok_or_else(|| {
            AnalyzerError::InferenceFailed("degenerate landmarks, cannot align face".into())
        })?;

        let input = arcface_tensor(&aligned);
        let outputs = self
            .recognizer
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AnalyzerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(AnalyzerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw)))
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn analyze(&mut self, image: &[u8]) -> Result<FaceScan, AnalyzerError> {
        let rgb = image::load_from_memory(image)?.to_rgb8();
        let boxes = self.detect(&rgb)?;
        tracing::debug!(
            faces = boxes.len(),
            width = rgb.width(),
            height = rgb.height(),
            "analyze: detection done"
        );

        FaceScan::from_detections(boxes, |bbox| self.embed(&rgb, bbox))
    }
}

/// Map each stride to its output tensors. Exports that name them
/// `score_8`, `bbox_8`, `kps_8`, ... are resolved by name; anything else
/// falls back to the insightface order `[scores 8/16/32, bboxes, kps]`.
fn stride_output_indices(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: u32| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let by_name: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match by_name.as_deref() {
        Some(&[a, b, c]) => {
            tracing::info!("SCRFD: using name-based output mapping");
            [a, b, c]
        }
        _ => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping"
            );
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

fn open_session(path: &Path) -> Result<Session, AnalyzerError> {
    if !path.exists() {
        return Err(AnalyzerError::ModelNotFound(path.display().to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;

    tracing::info!(
        path = %path.display(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );
    Ok(session)
}

/// Resize into the SCRFD square input, anchored at the top-left corner.
/// Returns the tensor and the scale applied to the source image.
fn letterbox(image: &RgbImage) -> (Array4<f32>, f32) {
    let size = SCRFD_INPUT_SIZE;
    let scale = (size as f32 / image.width() as f32).min(size as f32 / image.height() as f32);
    let new_w = ((image.width() as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((image.height() as f32 * scale).round() as u32).clamp(1, size);
    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Zero is the normalized value of the SCRFD mean, so padding stays neutral.
    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    (tensor, scale)
}

/// Decode one stride level into boxes in source-image coordinates.
fn decode_level(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: u32,
    scale: f32,
) -> Vec<BoundingBox> {
    let grid = (SCRFD_INPUT_SIZE / stride) as usize;
    let step = stride as f32;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;

    (0..anchors.min(scores.len()))
        .filter(|&idx| scores[idx] > SCRFD_CONFIDENCE_THRESHOLD)
        .filter(|&idx| idx * 4 + 3 < boxes.len() && idx * 10 + 9 < kps.len())
        .map(|idx| {
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * step;
            let ay = (cell / grid) as f32 * step;

            let d = &boxes[idx * 4..idx * 4 + 4];
            let x1 = (ax - d[0] * step) / scale;
            let y1 = (ay - d[1] * step) / scale;
            let x2 = (ax + d[2] * step) / scale;
            let y2 = (ay + d[3] * step) / scale;

            let k = &kps[idx * 10..idx * 10 + 10];
            let landmarks = std::array::from_fn(|i| {
                (
                    (ax + k[i * 2] * step) / scale,
                    (ay + k[i * 2 + 1] * step) / scale,
                )
            });

            BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: scores[idx],
                landmarks: Some(landmarks),
            }
        })
        .collect()
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let ix = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let iy = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = ix * iy;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut boxes: Vec<BoundingBox>, threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in boxes {
        if kept.iter().all(|k| iou(k, &candidate) <= threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// NCHW tensor of the aligned crop in RGB order, normalized to [-1, 1].
fn arcface_tensor(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn bbox(x: f32, y: f32, size: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: size,
            height: size,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_letterbox_scale_and_padding() {
        let img = RgbImage::from_pixel(320, 160, Rgb([255, 255, 255]));
        let (tensor, scale) = letterbox(&img);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((scale - 2.0).abs() < 1e-6);
        // Resized content is top-left, bottom half is neutral padding.
        let white = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 0, 10, 10]] - white).abs() < 1e-3);
        assert_eq!(tensor[[0, 0, 600, 10]], 0.0);
    }

    #[test]
    fn test_decode_level_maps_to_source_coordinates() {
        let grid = (SCRFD_INPUT_SIZE / 32) as usize;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let boxes = vec![1.0f32; anchors * 4];
        let kps = vec![0.0f32; anchors * 10];
        // Second row, first column, first anchor.
        let idx = grid * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;

        let dets = decode_level(&scores, &boxes, &kps, 32, 2.0);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        // Anchor at (0, 32) in input space, box ±32, halved back to source.
        assert!((d.x - -16.0).abs() < 1e-4);
        assert!((d.y - 0.0).abs() < 1e-4);
        assert!((d.width - 32.0).abs() < 1e-4);
        assert_eq!(d.landmarks.unwrap()[0], (0.0, 16.0));
    }

    #[test]
    fn test_decode_level_skips_low_scores() {
        let scores = vec![0.4f32; 8];
        let dets = decode_level(&scores, &[0.0; 32], &[0.0; 80], 32, 1.0);
        assert!(dets.is_empty());
    }

    #[test]
    fn test_nms_suppresses_overlap() {
        let boxes = vec![
            bbox(0.0, 0.0, 10.0, 0.7),
            bbox(1.0, 1.0, 10.0, 0.9),
            bbox(100.0, 100.0, 10.0, 0.8),
        ];
        let kept = nms(boxes, SCRFD_NMS_THRESHOLD);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.8);
    }

    #[test]
    fn test_iou_disjoint_and_identical() {
        let a = bbox(0.0, 0.0, 10.0, 1.0);
        assert_eq!(iou(&a, &bbox(50.0, 50.0, 10.0, 1.0)), 0.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_arcface_tensor_normalization() {
        let img = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([255, 0, 128]));
        let t = arcface_tensor(&img);
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
        assert!((t[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_stride_outputs_by_name() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            stride_output_indices(&names),
            [(2, 0, 1), (5, 3, 4), (8, 6, 7)]
        );
    }

    #[test]
    fn test_stride_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i| format!("{}", 400 + i)).collect();
        assert_eq!(
            stride_output_indices(&names),
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        );
        // A partial naming scheme is not trusted either.
        let mut partial = names.clone();
        partial[0] = "score_8".into();
        assert_eq!(stride_output_indices(&partial)[0], (0, 3, 6));
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxAnalyzer::load_from_dir(Path::new("/nonexistent/models")).err().unwrap();
        assert!(matches!(err, AnalyzerError::ModelNotFound(_)));
    }
}
