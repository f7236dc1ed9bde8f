use opencv::{
    core::{Mat, Vector},
    imgcodecs,
    prelude::*,
};
use side_camera_proto::UNKNOWN_CAMERA_ID;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Image buffer is empty")]
    EmptyBuffer,
    #[error("OpenCV decode error: {0}")]
    OpenCvDecodeError(opencv::Error),
    #[error("Image buffer did not decode to a raster")]
    NotAnImage,
}

/// Decodes a compressed still image into a BGR raster.
pub fn decode_frame(image_data: &[u8]) -> Result<Mat, DecodeError> {
    if image_data.is_empty() {
        return Err(DecodeError::EmptyBuffer);
    }
    let mat = imgcodecs::imdecode(&Vector::from_slice(image_data), imgcodecs::IMREAD_COLOR)
        .map_err(DecodeError::OpenCvDecodeError)?;
    if mat.empty() {
        return Err(DecodeError::NotAnImage);
    }
    Ok(mat)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub camera_id: String,
    pub timestamp: i64,
}

impl FrameMetadata {
    /// Fills in the defaults for fields the producer left out: a missing or
    /// blank camera id becomes `"unknown"`, a missing timestamp becomes the
    /// receipt time.
    pub fn resolve(camera_id: Option<&str>, timestamp: Option<i64>, received_at_ms: i64) -> Self {
        let camera_id = camera_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(UNKNOWN_CAMERA_ID)
            .to_string();
        Self {
            camera_id,
            timestamp: timestamp.unwrap_or(received_at_ms),
        }
    }
}

pub struct DecodedFrame {
    pub metadata: FrameMetadata,
    pub image: Mat,
}

impl DecodedFrame {
    pub fn camera_id(&self) -> &str {
        &self.metadata.camera_id
    }

    pub fn width(&self) -> i32 {
        self.image.cols()
    }

    pub fn height(&self) -> i32 {
        self.image.rows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    #[test]
    fn test_black_frame_round_trip() {
        let frame = Mat::new_rows_cols_with_default(64, 64, CV_8UC3, Scalar::all(0.0)).unwrap();
        let mut buf = Vector::<u8>::new();
        assert!(imgcodecs::imencode(".jpg", &frame, &mut buf, &Vector::new()).unwrap());

        let jpeg: Vec<u8> = buf.into();
        let decoded = decode_frame(&jpeg).unwrap();

        assert_eq!(decoded.rows(), 64);
        assert_eq!(decoded.cols(), 64);
        assert_eq!(decoded.channels(), 3);
        assert!(decoded.data_bytes().unwrap().iter().all(|&value| value < 8));
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(decode_frame(b"definitely not a jpeg").is_err());
        assert!(matches!(decode_frame(&[]), Err(DecodeError::EmptyBuffer)));
    }

    #[test]
    fn test_missing_camera_id_resolves_to_unknown() {
        let metadata = FrameMetadata::resolve(None, Some(42), 1_000);
        assert_eq!(metadata.camera_id, "unknown");
        assert_eq!(metadata.timestamp, 42);

        let blank = FrameMetadata::resolve(Some("  "), Some(42), 1_000);
        assert_eq!(blank.camera_id, "unknown");
    }

    #[test]
    fn test_missing_timestamp_resolves_to_receipt_time() {
        let metadata = FrameMetadata::resolve(Some("front"), None, 1_700_000_000_000);
        assert_eq!(metadata.camera_id, "front");
        assert_eq!(metadata.timestamp, 1_700_000_000_000);
    }
}
