//! Five-point face alignment for the ArcFace input.
//!
//! Estimates the similarity transform (scale, rotation, translation) that maps
//! detected landmarks onto the InsightFace reference layout, then resamples
//! the RGB image into a 112×112 crop.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit on centred point sets.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            (sx / n, sy / n)
        };
        let (scx, scy) = mean(src);
        let (dcx, dcy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut norm = 0.0f32;
        for (s, d) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (s.0 - scx, s.1 - scy);
            let (dx, dy) = (d.0 - dcx, d.1 - dcy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < 1e-6 {
            return None;
        }

        let a = dot / norm;
        let b = cross / norm;
        Some(Self {
            a,
            b,
            tx: dcx - (a * scx - b * scy),
            ty: dcy - (b * scx + a * scy),
        })
    }

    /// Map an output pixel back into source coordinates.
    fn invert_point(&self, x: f32, y: f32) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (dx, dy) = (x - self.tx, y - self.ty);
        (
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        )
    }
}

/// Produce the aligned 112×112 face crop, or `None` when the landmarks are
/// degenerate (all points coincide).
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> Option<RgbImage> {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112)?;
    Some(RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |x, y| {
        let (sx, sy) = transform.invert_point(x as f32, y as f32);
        sample_bilinear(image, sx, sy)
    }))
}

/// Bilinear sample; outside the image reads as black.
fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let px = |xi: i64, yi: i64| -> [f32; 3] {
        if xi < 0 || yi < 0 || xi >= w || yi >= h {
            return [0.0; 3];
        }
        let p = image.get_pixel(xi as u32, yi as u32);
        [p[0] as f32, p[1] as f32, p[2] as f32]
    };

    let (tl, tr) = (px(x0, y0), px(x0 + 1, y0));
    let (bl, br) = (px(x0, y0 + 1), px(x0 + 1, y0 + 1));

    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}
