//! rollcall-core: on-device attendance recognition engine.
//!
//! Locates faces with SCRFD, embeds them with ArcFace (both via ONNX Runtime),
//! matches embeddings against a local identity gallery, and turns stable
//! matches into deduplicated attendance events. Nothing here touches the
//! network.

pub mod crop;
pub mod decision;
pub mod detector;
pub mod extractor;
pub mod gallery;
pub mod model;
pub mod pipeline;
pub mod recorder;
pub mod types;
pub mod worker;

pub use decision::{DecisionConfig, DecisionEngine, Observation, TrackStatus};
pub use detector::{FaceLocator, LocatorConfig, ScrfdLocator};
pub use extractor::{ArcfaceExtractor, EmbeddingExtractor};
pub use gallery::{Gallery, GalleryConfig, GalleryEntry, Reference, SharedGallery};
pub use model::{default_model_dir, ModelManifest};
pub use pipeline::{Analyzer, FrameAnalysis, ServiceHealth, Session};
pub use recorder::{AttendanceEvent, AttendanceRecorder, SessionWindow};
pub use types::{BoundingBox, DistanceMetric, Embedding, FaceRegion, Frame, PersonId};

/// A source of frames, e.g. a camera or a directory of stills.
pub trait FrameSource {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>, Self::Error>;
}
