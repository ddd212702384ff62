//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, PixelFormat};
use rollcall_core::{Frame, FrameSource};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Fraction of near-black pixels above which a frame is discarded.
const DARK_FRAME_PCT: f32 = 0.95;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Requested capture geometry.
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    /// Consecutive dark frames tolerated before `next_frame` gives up.
    pub max_dark_frames: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            max_dark_frames: 30,
        }
    }
}

/// V4L2 camera acting as a continuous [`FrameSource`].
pub struct Camera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    max_dark_frames: usize,
    /// Wall clock at open, paired with a monotonic instant so frame
    /// timestamps never go backwards.
    opened_at_ms: u64,
    opened: Instant,
    dark_skipped: u64,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str, settings: CaptureSettings) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; accept GREY or Y16 if the driver insists
        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = settings.width;
        fmt.height = settings.height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(&negotiated.fourcc.repr).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, GREY, or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "camera opened"
        );

        Ok(Self {
            device,
            stream: None,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc: negotiated.fourcc,
            pixel_format,
            max_dark_frames: settings.max_dark_frames,
            opened_at_ms: crate::now_ms(),
            opened: Instant::now(),
            dark_skipped: 0,
        })
    }

    /// Dark frames discarded since open.
    pub fn dark_skipped(&self) -> u64 {
        self.dark_skipped
    }

    fn timestamp_ms(&self) -> u64 {
        self.opened_at_ms + self.opened.elapsed().as_millis() as u64
    }

    /// Dequeue one raw buffer and convert it, dark or not.
    pub fn capture_raw(&mut self) -> Result<(Vec<u8>, u32), CameraError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
                .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
            self.stream = Some(stream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(CameraError::CaptureFailed("stream not initialized".into()));
        };

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;
        let gray = self
            .pixel_format
            .to_grayscale(buf, self.width, self.height)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
        Ok((gray, sequence))
    }

    /// Discard `count` frames while auto-exposure settles.
    pub fn warm_up(&mut self, count: usize) {
        if count > 0 {
            tracing::info!(count, "discarding warmup frames");
        }
        for _ in 0..count {
            if let Err(e) = self.capture_raw() {
                tracing::warn!(error = %e, "warmup capture failed");
            }
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let dev = Device::with_path(&path).ok()?;
                let caps = dev.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    type Error = CameraError;

    /// Next non-dark frame. A camera stream never ends on its own.
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        for _ in 0..=self.max_dark_frames {
            let (data, sequence) = self.capture_raw()?;
            if frame::is_dark_frame(&data, DARK_FRAME_PCT) {
                self.dark_skipped += 1;
                tracing::debug!(seq = sequence, "skipping dark frame");
                continue;
            }
            return Ok(Some(Frame {
                data,
                width: self.width,
                height: self.height,
                timestamp_ms: self.timestamp_ms(),
                sequence,
            }));
        }
        Err(CameraError::CaptureFailed(format!(
            "{} consecutive dark frames; is the lens covered?",
            self.max_dark_frames + 1
        )))
    }
}
