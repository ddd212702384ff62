use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// A captured grayscale frame.
///
/// Frames are consumed by value during analysis and dropped afterwards;
/// nothing downstream retains pixel data.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub sequence: u32,
}

impl Frame {
    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    pub fn pixel(&self, x: usize, y: usize) -> u8 {
        self.data
            .get(y * self.width as usize + x)
            .copied()
            .unwrap_or(0)
    }
}

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Intersection-over-Union with another box, in [0, 1].
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }

    /// Clip the box to a `width` × `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let x1 = self.x.clamp(0.0, width as f32);
        let y1 = self.y.clamp(0.0, height as f32);
        let x2 = (self.x + self.width).clamp(0.0, width as f32);
        let y2 = (self.y + self.height).clamp(0.0, height as f32);
        BoundingBox::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0))
    }
}

/// A detected face in a single frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRegion {
    /// Timestamp of the frame the region was found in.
    pub timestamp_ms: u64,
    pub bbox: BoundingBox,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

/// Face embedding vector (512-dimensional for ArcFace).
///
/// `Debug` deliberately omits the values so embeddings never end up in logs.
#[derive(Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Timestamp of the frame the embedding was extracted from.
    pub timestamp_ms: u64,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl fmt::Debug for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedding")
            .field("dim", &self.values.len())
            .field("timestamp_ms", &self.timestamp_ms)
            .field("model_version", &self.model_version)
            .finish()
    }
}

impl Embedding {
    pub fn new(values: Vec<f32>, timestamp_ms: u64) -> Self {
        Self {
            values,
            timestamp_ms,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// True when every component is finite (no NaN or ±Inf).
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Distance under `metric`. Lower = more similar.
    pub fn distance(&self, other: &Embedding, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Cosine => 1.0 - self.similarity(other),
            DistanceMetric::Euclidean => self.euclidean_distance(other),
        }
    }

    /// Bitwise equality of the vector, ignoring metadata.
    pub fn same_values(&self, other: &Embedding) -> bool {
        self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

/// How gallery distances are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`, in [0, 2].
    #[default]
    Cosine,
    /// L2 distance.
    Euclidean,
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "euclidean" | "l2" => Ok(Self::Euclidean),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cosine => f.write_str("cosine"),
            Self::Euclidean => f.write_str("euclidean"),
        }
    }
}

/// Enrolled person identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonId(String);

impl PersonId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PersonId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding::new(values, 0)
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(vec![1.0, 0.0, 0.0]);
        let b = emb(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_distance_metrics() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![-1.0, 0.0]);
        assert!((a.distance(&b, DistanceMetric::Cosine) - 2.0).abs() < 1e-6);
        assert!((a.distance(&b, DistanceMetric::Euclidean) - 2.0).abs() < 1e-6);
        assert!(a.distance(&a, DistanceMetric::Cosine).abs() < 1e-6);
    }

    #[test]
    fn test_is_finite() {
        assert!(emb(vec![0.1, -0.2]).is_finite());
        assert!(!emb(vec![0.1, f32::NAN]).is_finite());
        assert!(!emb(vec![f32::INFINITY, 0.0]).is_finite());
    }

    #[test]
    fn test_metric_from_str() {
        assert_eq!("Cosine".parse::<DistanceMetric>(), Ok(DistanceMetric::Cosine));
        assert_eq!("l2".parse::<DistanceMetric>(), Ok(DistanceMetric::Euclidean));
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }

    #[test]
    fn test_iou_partial() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 10.0, 10.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 10.0, 10.0);
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_clamp_to_frame() {
        let b = BoundingBox::new(-10.0, 90.0, 50.0, 50.0).clamp_to(100, 100);
        assert_eq!(b, BoundingBox::new(0.0, 90.0, 40.0, 10.0));
        let outside = BoundingBox::new(200.0, 200.0, 10.0, 10.0).clamp_to(100, 100);
        assert_eq!(outside.area(), 0.0);
    }

    #[test]
    fn test_embedding_debug_hides_values() {
        let e = emb(vec![0.123456, 0.654321]);
        let printed = format!("{e:?}");
        assert!(!printed.contains("0.123456"));
        assert!(printed.contains("dim: 2"));
    }
}
