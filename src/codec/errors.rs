//! Frame parsing and validation errors
//!
//! Errors raised while unmarshaling frames from the byte stream exchanged with
//! the session core.

use std::fmt;
use std::fmt::Display;

/// Frame parsing errors
#[derive(Debug)]
pub(crate) enum FrameError {
    /// Buffer does not hold a complete frame yet
    ///
    /// Occurs when the buffer is shorter than the header, or shorter than
    /// header + declared payload length. The reader should wait for more
    /// bytes rather than drop the connection.
    TooShort,

    /// Frame header or payload format is invalid
    ///
    /// Occurs when:
    /// - Magic number is not 0x5350
    /// - Protocol version is not 0x01
    /// - Frame type is unknown (not 1-4)
    /// - JSON deserialization fails
    Invalid,

    /// Declared payload length exceeds [`crate::codec::frame::MAX_PAYLOAD_LEN`]
    TooLarge(usize),
}

impl std::error::Error for FrameError {}

impl Display for FrameError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::TooShort => "stream ended early".fmt(fmt),
            FrameError::Invalid => "invalid frame".fmt(fmt),
            FrameError::TooLarge(len) => write!(fmt, "frame payload too large: {} bytes", len),
        }
    }
}
