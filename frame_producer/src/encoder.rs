use opencv::{
    core::{Mat, Vector},
    imgcodecs,
    prelude::*,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(opencv::Error),
    #[error("Encoder rejected the frame")]
    Rejected,
    #[error("Cannot encode an empty frame")]
    EmptyFrame,
}

/// Compresses a raw frame to a JPEG buffer.
pub fn encode_jpeg(frame: &Mat, quality: i32) -> Result<Vec<u8>, EncodeError> {
    if frame.empty() {
        return Err(EncodeError::EmptyFrame);
    }

    let params =
        Vector::<i32>::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, quality.clamp(0, 100)]);
    let mut buf = Vector::<u8>::new();
    let encoded = imgcodecs::imencode(".jpg", frame, &mut buf, &params)
        .map_err(EncodeError::EncodeFrameFailed)?;
    if !encoded || buf.is_empty() {
        return Err(EncodeError::Rejected);
    }
    Ok(buf.into())
}
