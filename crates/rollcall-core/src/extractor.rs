//! Embedding Extractor: ArcFace via ONNX Runtime.
//!
//! Turns a face region into a 512-dimensional, L2-normalized embedding using
//! the w600k_r50 ArcFace model.

use crate::crop::{self, CROP_SIZE};
use crate::model::{ModelAsset, ModelError};
use crate::types::{Embedding, FaceRegion, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0; ArcFace normalizes symmetrically
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("degenerate crop: region clipped to the frame has zero area")]
    DegenerateCrop,
    #[error("model produced a non-finite embedding")]
    NonFinite,
    #[error("expected {expected}-dim embedding, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model asset: {0}")]
    Model(#[from] ModelError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces identity embeddings for located faces.
pub trait EmbeddingExtractor {
    /// Same input bytes always produce the same embedding.
    fn embed(&mut self, frame: &Frame, region: &FaceRegion) -> Result<Embedding, ExtractionError>;
}

/// ArcFace-based [`EmbeddingExtractor`].
pub struct ArcfaceExtractor {
    session: Session,
    model_version: String,
}

impl ArcfaceExtractor {
    /// Verify and load the ArcFace model asset.
    pub fn load(asset: &ModelAsset, intra_threads: usize) -> Result<Self, ExtractionError> {
        asset.verify()?;

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(&asset.path)?;

        tracing::info!(
            path = %asset.path.display(),
            version = %asset.version,
            "loaded ArcFace model"
        );

        Ok(Self {
            session,
            model_version: asset.version.clone(),
        })
    }

    /// Preprocess a 112x112 grayscale crop into a NCHW float tensor.
    fn preprocess(face: &[u8]) -> Array4<f32> {
        let mut tensor = Array4::<f32>::zeros((1, 3, CROP_SIZE, CROP_SIZE));

        for y in 0..CROP_SIZE {
            for x in 0..CROP_SIZE {
                let pixel = face.get(y * CROP_SIZE + x).copied().unwrap_or(0) as f32;
                let normalized = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
                // Grayscale → 3-channel: replicate Y
                for c in 0..3 {
                    tensor[[0, c, y, x]] = normalized;
                }
            }
        }

        tensor
    }
}

impl EmbeddingExtractor for ArcfaceExtractor {
    fn embed(&mut self, frame: &Frame, region: &FaceRegion) -> Result<Embedding, ExtractionError> {
        let face = face_crop(frame, region)?;
        let input = Self::preprocess(&face);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractionError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let mut embedding = finalize_embedding(raw.to_vec(), ARCFACE_EMBEDDING_DIM, region.timestamp_ms)?;
        embedding.model_version = Some(self.model_version.clone());
        Ok(embedding)
    }
}

/// Produce the canonical crop for `region`, or reject a degenerate one.
///
/// Landmark alignment is used when landmarks are present; otherwise the
/// clipped bounding box is resized.
pub fn face_crop(frame: &Frame, region: &FaceRegion) -> Result<Vec<u8>, ExtractionError> {
    let clipped = region.bbox.clamp_to(frame.width, frame.height);
    if !(clipped.area() > 0.0) {
        return Err(ExtractionError::DegenerateCrop);
    }

    Ok(match &region.landmarks {
        Some(landmarks) if landmarks.iter().all(|(x, y)| x.is_finite() && y.is_finite()) => {
            crop::align_face(frame, landmarks)
        }
        _ => crop::crop_resize(frame, &clipped),
    })
}

/// Validate raw model output and L2-normalize it.
pub fn finalize_embedding(raw: Vec<f32>, expected_dim: usize, timestamp_ms: u64) -> Result<Embedding, ExtractionError> {
    if raw.len() != expected_dim {
        return Err(ExtractionError::Dimension {
            expected: expected_dim,
            actual: raw.len(),
        });
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(ExtractionError::NonFinite);
    }

    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    // Overflow in the norm would turn every component into 0 or NaN
    if !norm.is_finite() {
        return Err(ExtractionError::NonFinite);
    }
    let values = if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    };

    Ok(Embedding::new(values, timestamp_ms))
}
