//! Serialization and deserialization for the `ChatSync` wire protocol.
//!
//! Frames travel as WebSocket text frames holding one JSON object each.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Maximum accepted size of a single encoded frame (8 MB).
///
/// Large enough for a history batch or a message with an inline image.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Encodes a frame into its JSON text form.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the frame cannot be serialized,
/// or [`CodecError::FrameTooLarge`] if the result exceeds [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(frame: &T) -> Result<String, CodecError> {
    let text = serde_json::to_string(frame)?;
    check_size(text.len())?;
    Ok(text)
}

/// Decodes a frame from its JSON text form.
///
/// The size limit is checked before parsing.
///
/// # Errors
///
/// Returns [`CodecError::FrameTooLarge`] for oversized input, or
/// [`CodecError::Serialization`] if the text is not a valid frame.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    check_size(text.len())?;
    Ok(serde_json::from_str(text)?)
}

const fn check_size(size: usize) -> Result<(), CodecError> {
    if size > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}
