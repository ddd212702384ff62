//! Raw buffer → grayscale conversion and dark-frame detection.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("{format:?} buffer too short: expected {expected} bytes, got {actual}")]
    Truncated {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Negotiated camera pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, 2 bytes/pixel; luma is every even byte.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    /// Match a V4L2 fourcc.
    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Grey => 1,
            Self::Yuyv | Self::Y16 => 2,
        }
    }

    /// Convert one raw buffer to `width * height` grayscale bytes.
    pub fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        let pixels = (width as usize) * (height as usize);
        let expected = pixels * self.bytes_per_pixel();
        if buf.len() < expected {
            return Err(FrameError::Truncated {
                format: self,
                expected,
                actual: buf.len(),
            });
        }

        let raw = &buf[..expected];
        Ok(match self {
            Self::Grey => raw.to_vec(),
            Self::Yuyv => raw.iter().step_by(2).copied().collect(),
            // Keep the high byte of each little-endian sample
            Self::Y16 => raw.chunks_exact(2).map(|px| px[1]).collect(),
        })
    }
}

/// True when more than `threshold_pct` of pixels are in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}
