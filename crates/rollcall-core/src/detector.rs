//! Face Locator: SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.

use crate::model::{ModelAsset, ModelError};
use crate::types::{BoundingBox, FaceRegion, Frame, Landmarks};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    /// The detection model could not run for this frame.
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("model asset: {0}")]
    Model(#[from] ModelError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds candidate face regions in a frame.
pub trait FaceLocator {
    /// Regions sorted by descending confidence, already non-max suppressed.
    fn locate(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Tunables for [`ScrfdLocator`].
#[derive(Debug, Clone, Copy)]
pub struct LocatorConfig {
    /// Anchors at or below this score are discarded during decoding.
    pub score_threshold: f32,
    /// Boxes whose IoU with a stronger box exceeds this are suppressed.
    pub nms_threshold: f32,
    pub intra_threads: usize,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            nms_threshold: 0.4,
            intra_threads: 2,
        }
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (target as f32 - new_w) / 2.0,
            pad_y: (target as f32 - new_h) / 2.0,
        }
    }

    /// Letterboxed model space → original frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based [`FaceLocator`].
pub struct ScrfdLocator {
    session: Session,
    config: LocatorConfig,
    /// Per-stride output indices for strides [8, 16, 32].
    stride_outputs: [StrideOutputs; 3],
}

impl ScrfdLocator {
    /// Verify and load the SCRFD model asset.
    pub fn load(asset: &ModelAsset, config: LocatorConfig) -> Result<Self, DetectorError> {
        asset.verify()?;

        let session = Session::builder()?
            .with_intra_threads(config.intra_threads)?
            .commit_from_file(&asset.path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %asset.path.display(),
            version = %asset.version,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::Unavailable(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = discover_output_indices(&output_names);
        tracing::debug!(?stride_outputs, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            config,
            stride_outputs,
        })
    }

    /// Resize a grayscale frame into a letterboxed NCHW float tensor.
    fn preprocess(frame: &Frame) -> (Array4<f32>, Letterbox) {
        let (width, height) = (frame.width as usize, frame.height as usize);
        let letterbox = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
        let new_w = (width as f32 * letterbox.scale).round() as usize;
        let new_h = (height as f32 * letterbox.scale).round() as usize;
        let resized = resize_bilinear(&frame.data, width, height, new_w, new_h);

        let pad_x = letterbox.pad_x.floor() as usize;
        let pad_y = letterbox.pad_y.floor() as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));

        for y in 0..SCRFD_INPUT_SIZE {
            for x in 0..SCRFD_INPUT_SIZE {
                let inside = (pad_y..pad_y + new_h).contains(&y) && (pad_x..pad_x + new_w).contains(&x);
                // Padding uses the mean so it normalizes to 0.0
                let pixel = if inside {
                    resized[(y - pad_y) * new_w + (x - pad_x)] as f32
                } else {
                    SCRFD_MEAN
                };
                let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
                for c in 0..3 {
                    tensor[[0, c, y, x]] = normalized;
                }
            }
        }

        (tensor, letterbox)
    }
}

impl FaceLocator for ScrfdLocator {
    fn locate(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, DetectorError> {
        if !frame_fits(frame) {
            return Ok(Vec::new());
        }

        let (input, letterbox) = Self::preprocess(frame);
        let unavailable = |e: ort::Error| DetectorError::Unavailable(e.to_string());

        let input = TensorRef::from_array_view(input.view()).map_err(unavailable)?;
        let outputs = self.session.run(ort::inputs![input]).map_err(unavailable)?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::Unavailable(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;

            candidates.extend(decode_stride(
                StrideTensors { scores, bboxes, kps },
                stride,
                &letterbox,
                self.config.score_threshold,
                frame.timestamp_ms,
            ));
        }

        Ok(nms(candidates, self.config.nms_threshold))
    }
}

/// Bilinear resize of a grayscale buffer.
/// Non-empty frame whose buffer holds at least `width * height` pixels.
fn frame_fits(frame: &Frame) -> bool {
    (frame.width as usize)
        .checked_mul(frame.height as usize)
        .is_some_and(|pixels| pixels > 0 && frame.data.len() >= pixels)
}

pub(crate) fn resize_bilinear(src: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let mut out = vec![0u8; new_w * new_h];
    if width == 0 || height == 0 || new_w == 0 || new_h == 0 {
        return out;
    }
    let inv_x = width as f32 / new_w as f32;
    let inv_y = height as f32 / new_h as f32;

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_y - 0.5;
        let y0 = (src_y.floor() as i64).clamp(0, height as i64 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_x - 0.5;
            let x0 = (src_x.floor() as i64).clamp(0, width as i64 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let val = src[y0 * width + x0] as f32 * (1.0 - fx) * (1.0 - fy)
                + src[y0 * width + x1] as f32 * fx * (1.0 - fy)
                + src[y1 * width + x0] as f32 * (1.0 - fx) * fy
                + src[y1 * width + x1] as f32 * fx * fy;

            out[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Discover output tensor ordering by name.
///
/// Named exports ("score_8", "bbox_16", "kps_32", ...) map directly to stride
/// slots. Anything else falls back to the standard positional ordering:
///   [0-2] = scores, [3-5] = bboxes, [6-8] = kps (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(found) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

struct StrideTensors<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// Decode the candidate regions of one stride level.
fn decode_stride(
    tensors: StrideTensors<'_>,
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
    timestamp_ms: u64,
) -> Vec<FaceRegion> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut regions = Vec::new();

    for idx in 0..num_anchors {
        let score = tensors.scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let Some(offsets) = tensors.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid_w) as f32 * step;
        let anchor_y = (cell / grid_w) as f32 * step;

        let (x1, y1) = letterbox.unmap(anchor_x - offsets[0] * step, anchor_y - offsets[1] * step);
        let (x2, y2) = letterbox.unmap(anchor_x + offsets[2] * step, anchor_y + offsets[3] * step);

        let landmarks = tensors.kps.get(idx * 10..idx * 10 + 10).map(|k| {
            let mut lms: Landmarks = [(0.0, 0.0); 5];
            for (i, lm) in lms.iter_mut().enumerate() {
                *lm = letterbox.unmap(anchor_x + k[i * 2] * step, anchor_y + k[i * 2 + 1] * step);
            }
            lms
        });

        regions.push(FaceRegion {
            timestamp_ms,
            bbox: BoundingBox::new(x1, y1, x2 - x1, y2 - y1),
            confidence: score,
            landmarks,
        });
    }

    regions
}

/// Non-maximum suppression.
///
/// Keeps the highest-confidence region and discards every remaining region
/// whose IoU with a kept one exceeds `iou_threshold`. Output is sorted by
/// descending confidence.
pub fn nms(mut regions: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceRegion> = Vec::with_capacity(regions.len());
    for region in regions {
        if keep.iter().all(|k| k.bbox.iou(&region.bbox) <= iou_threshold) {
            keep.push(region);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: f32, y: f32, w: f32, h: f32, conf: f32) -> FaceRegion {
        FaceRegion {
            timestamp_ms: 0,
            bbox: BoundingBox::new(x, y, w, h),
            confidence: conf,
            landmarks: None,
        }
    }

    #[test]
    fn test_frame_fits_guards_size() {
        let frame = |width, height, len| Frame {
            data: vec![0u8; len],
            width,
            height,
            timestamp_ms: 0,
            sequence: 0,
        };
        assert!(frame_fits(&frame(4, 3, 12)));
        assert!(!frame_fits(&frame(4, 3, 11)));
        assert!(!frame_fits(&frame(0, 3, 12)));
        // 65536 * 65536 overflows u32; the guard must not wrap to 0
        assert!(!frame_fits(&frame(65_536, 65_536, 16)));
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let regions = vec![
            region(5.0, 5.0, 100.0, 100.0, 0.8),
            region(200.0, 200.0, 50.0, 50.0, 0.7),
            region(0.0, 0.0, 100.0, 100.0, 0.9),
        ];
        let result = nms(regions, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_threshold_is_exclusive() {
        // IoU exactly 1/3 with a threshold of 1/3 is kept
        let a = region(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = region(5.0, 0.0, 10.0, 10.0, 0.8);
        let iou = a.bbox.iou(&b.bbox);
        assert_eq!(nms(vec![a.clone(), b.clone()], iou).len(), 2);
        assert_eq!(nms(vec![a, b], iou - 0.01).len(), 1);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_unmap_roundtrip() {
        let lb = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        let (ox, oy) = (100.0f32, 50.0f32);
        let (rx, ry) = lb.unmap(ox * lb.scale + lb.pad_x, oy * lb.scale + lb.pad_y);
        assert!((rx - ox).abs() < 0.1, "x: {rx} vs {ox}");
        assert!((ry - oy).abs() < 0.1, "y: {ry} vs {oy}");
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        let stride = 32;
        let grid = SCRFD_INPUT_SIZE / stride;
        let n = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; n];
        let mut bboxes = vec![0.0f32; n * 4];
        let kps = vec![0.0f32; n * 10];

        // Anchor in cell (col 2, row 1), first of its pair
        let idx = (grid + 2) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let identity = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let regions = decode_stride(
            StrideTensors { scores: &scores, bboxes: &bboxes, kps: &kps },
            stride,
            &identity,
            0.5,
            42,
        );

        assert_eq!(regions.len(), 1);
        let r = &regions[0];
        assert_eq!(r.timestamp_ms, 42);
        assert_eq!(r.bbox, BoundingBox::new(32.0, 0.0, 64.0, 64.0));
        assert_eq!(r.landmarks.map(|l| l[0]), Some((64.0, 32.0)));
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_resize_bilinear_uniform() {
        let src = vec![128u8; 100 * 100];
        let out = resize_bilinear(&src, 100, 100, 200, 150);
        assert_eq!(out.len(), 200 * 150);
        assert!(out.iter().all(|&p| p == 128));
    }
}
