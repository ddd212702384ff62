//! rollcall-hw: frame sources for the recognition pipeline.
//!
//! Provides V4L2-based camera capture and a still-image source for
//! enrollment photos and offline replay.

pub mod camera;
pub mod frame;
pub mod stills;

pub use camera::{Camera, CameraError, DeviceInfo};
pub use frame::PixelFormat;
pub use stills::{load_image, StillsError, StillsSource};

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
