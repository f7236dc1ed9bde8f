use opencv::{core::Mat, prelude::*, videoio};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Failed to open {source_name}")]
    OpenFailed { source_name: String },
    #[error("Failed to open {source_name}: {error}")]
    OpenCvOpenFailed {
        source_name: String,
        error: opencv::Error,
    },
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(opencv::Error),
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq)]
pub enum VideoSource {
    File(PathBuf),
    Device(i32),
}

impl VideoSource {
    pub fn from_arg(video: Option<PathBuf>, device_index: i32) -> Self {
        match video {
            Some(path) => VideoSource::File(path),
            None => {
                tracing::info!(
                    "No video file provided, attempting to use webcam {}",
                    device_index
                );
                VideoSource::Device(device_index)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            VideoSource::File(path) => format!("video file {}", path.display()),
            VideoSource::Device(index) => format!("capture device {}", index),
        }
    }

    /// Opens the capture. A missing file is reported before any device is touched.
    pub fn open(&self) -> Result<CaptureSource, SourceError> {
        let source_name = self.describe();
        let capture = match self {
            VideoSource::File(path) => {
                if !path.exists() {
                    return Err(SourceError::FileNotFound(path.clone()));
                }
                videoio::VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)
            }
            VideoSource::Device(index) => videoio::VideoCapture::new(*index, videoio::CAP_ANY),
        }
        .map_err(|error| SourceError::OpenCvOpenFailed {
            source_name: source_name.clone(),
            error,
        })?;

        let opened = capture
            .is_opened()
            .map_err(|error| SourceError::OpenCvOpenFailed {
                source_name: source_name.clone(),
                error,
            })?;
        if !opened {
            return Err(SourceError::OpenFailed { source_name });
        }

        tracing::info!("Opened {}", source_name);
        Ok(CaptureSource {
            capture,
            source_name,
        })
    }
}

/// A sequential supplier of raw frames. `Ok(None)` marks the end of the stream.
pub trait FrameSource: Send + 'static {
    fn read_frame(&mut self) -> Result<Option<Mat>, SourceError>;
}

/// An opened OpenCV capture. Released when dropped.
pub struct CaptureSource {
    capture: videoio::VideoCapture,
    source_name: String,
}

impl FrameSource for CaptureSource {
    fn read_frame(&mut self) -> Result<Option<Mat>, SourceError> {
        let mut frame = Mat::default();
        let grabbed = self
            .capture
            .read(&mut frame)
            .map_err(SourceError::ReadFrameFailed)?;
        if !grabbed || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        match self.capture.release() {
            Ok(()) => tracing::info!("Released {}", self.source_name),
            Err(e) => tracing::warn!("Failed to release {}: {:?}", self.source_name, e),
        }
    }
}

/// Solid-colour frames whose grey level rises with the frame index.
#[cfg(any(test, feature = "synthetic-source"))]
pub struct SyntheticSource {
    remaining: usize,
    index: usize,
    width: i32,
    height: i32,
}

#[cfg(any(test, feature = "synthetic-source"))]
impl SyntheticSource {
    pub fn new(frames: usize, width: i32, height: i32) -> Self {
        Self {
            remaining: frames,
            index: 0,
            width,
            height,
        }
    }

    pub fn grey_level(index: usize) -> f64 {
        ((index * 20) % 256) as f64
    }
}

#[cfg(any(test, feature = "synthetic-source"))]
impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<Option<Mat>, SourceError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let frame = Mat::new_rows_cols_with_default(
            self.height,
            self.width,
            opencv::core::CV_8UC3,
            opencv::core::Scalar::all(Self::grey_level(self.index)),
        )
        .map_err(SourceError::ReadFrameFailed)?;
        self.remaining -= 1;
        self.index += 1;
        Ok(Some(frame))
    }
}
