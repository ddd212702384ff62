//! Still-image frame source: enrollment photos and offline replay.

use rollcall_core::{Frame, FrameSource};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "pgm"];

#[derive(Error, Debug)]
pub enum StillsError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Load one image file as a grayscale frame.
pub fn load_image(path: &Path, timestamp_ms: u64, sequence: u32) -> Result<Frame, StillsError> {
    let img = image::open(path).map_err(|source| StillsError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    let gray = img.to_luma8();
    let (width, height) = gray.dimensions();
    Ok(Frame {
        data: gray.into_raw(),
        width,
        height,
        timestamp_ms,
        sequence,
    })
}

/// Replays a sorted list of image files as frames spaced `interval_ms` apart.
///
/// Replay runs in real time: frame `n` is not returned before
/// `n * interval_ms` has elapsed since the source was created.
pub struct StillsSource {
    paths: Vec<PathBuf>,
    next: usize,
    started: Instant,
    start_ms: u64,
    interval_ms: u64,
}

impl StillsSource {
    pub fn from_paths(paths: Vec<PathBuf>, interval_ms: u64) -> Self {
        Self {
            paths,
            next: 0,
            started: Instant::now(),
            start_ms: crate::now_ms(),
            interval_ms,
        }
    }

    /// Every image file in `dir`, in file-name order.
    pub fn from_dir(dir: &Path, interval_ms: u64) -> Result<Self, StillsError> {
        let io_err = |source| StillsError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
            if is_image {
                paths.push(path);
            }
        }
        paths.sort();
        tracing::info!(dir = %dir.display(), frames = paths.len(), "stills source opened");
        Ok(Self::from_paths(paths, interval_ms))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for StillsSource {
    type Error = StillsError;

    fn next_frame(&mut self) -> Result<Option<Frame>, StillsError> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        let index = self.next;
        self.next += 1;

        let offset_ms = index as u64 * self.interval_ms;
        let due = self.started + Duration::from_millis(offset_ms);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
        let timestamp_ms = self.start_ms + offset_ms;
        load_image(path, timestamp_ms, index as u32).map(Some)
    }
}
