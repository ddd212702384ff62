//! Face crops for the embedding model.
//!
//! Two paths produce a canonical 112×112 grayscale crop: landmark alignment
//! via a 4-DOF similarity transform (scale, rotation, translation) onto the
//! InsightFace reference points, and a plain bilinear crop/resize of the
//! bounding box when the detector gave no landmarks.

use crate::types::{BoundingBox, Frame, Landmarks};

/// Side length of the crop fed to the embedding model.
pub const CROP_SIZE: usize = 112;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Similarity transform `dst = [[a, -b], [b, a]] * src + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Least-squares fit of `src` onto `dst`.
    ///
    /// Each point pair contributes two rows to an overdetermined system in
    /// `[a, b, tx, ty]`:
    ///   sx * a - sy * b + tx = dx
    ///   sy * a + sx * b + ty = dy
    /// solved through the 4×4 normal equations.
    pub fn estimate(src: &Landmarks, dst: &Landmarks) -> Self {
        let mut ata = [[0.0f32; 4]; 4];
        let mut atb = [0.0f32; 4];

        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
            for (row, rhs) in rows {
                for j in 0..4 {
                    for k in 0..4 {
                        ata[j][k] += row[j] * row[k];
                    }
                    atb[j] += row[j] * rhs;
                }
            }
        }

        match solve_normal_equations(ata, atb) {
            Some([a, b, tx, ty]) => Self { a, b, tx, ty },
            None => Self::IDENTITY,
        }
    }

    /// Map a destination (crop) pixel back into source (frame) space.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det.abs() < 1e-12 {
            return None;
        }
        let (ia, ib) = (self.a / det, self.b / det);
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some((ia * dx + ib * dy, -ib * dx + ia * dy))
    }
}

/// Gaussian elimination with partial pivoting. `None` for a singular system.
#[allow(clippy::needless_range_loop)]
fn solve_normal_equations(mut m: [[f32; 4]; 4], mut rhs: [f32; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Bilinear sample at a sub-pixel position; outside the frame reads as 0.
fn sample_bilinear(frame: &Frame, sx: f32, sy: f32) -> f32 {
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let px = |x: i64, y: i64| -> f32 {
        if x >= 0 && y >= 0 && x < frame.width as i64 && y < frame.height as i64 {
            frame.pixel(x as usize, y as usize) as f32
        } else {
            0.0
        }
    };

    px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x0 + 1, y0) * fx * (1.0 - fy)
        + px(x0, y0 + 1) * (1.0 - fx) * fy
        + px(x0 + 1, y0 + 1) * fx * fy
}

/// Warp the face described by `landmarks` into the canonical crop.
pub fn align_face(frame: &Frame, landmarks: &Landmarks) -> Vec<u8> {
    let transform = SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS);
    let mut out = vec![0u8; CROP_SIZE * CROP_SIZE];

    for oy in 0..CROP_SIZE {
        for ox in 0..CROP_SIZE {
            if let Some((sx, sy)) = transform.invert_point(ox as f32, oy as f32) {
                out[oy * CROP_SIZE + ox] = sample_bilinear(frame, sx, sy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Crop `bbox` (already clipped to the frame) and resize it to the canonical crop.
pub fn crop_resize(frame: &Frame, bbox: &BoundingBox) -> Vec<u8> {
    let sx_scale = bbox.width / CROP_SIZE as f32;
    let sy_scale = bbox.height / CROP_SIZE as f32;
    let mut out = vec![0u8; CROP_SIZE * CROP_SIZE];

    for oy in 0..CROP_SIZE {
        let sy = bbox.y + (oy as f32 + 0.5) * sy_scale - 0.5;
        for ox in 0..CROP_SIZE {
            let sx = bbox.x + (ox as f32 + 0.5) * sx_scale - 0.5;
            let sx = sx.clamp(0.0, (frame.width.max(1) - 1) as f32);
            let sy = sy.clamp(0.0, (frame.height.max(1) - 1) as f32);
            out[oy * CROP_SIZE + ox] = sample_bilinear(frame, sx, sy).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}
