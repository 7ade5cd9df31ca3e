use std::io;

/// Errors raised while encoding or decoding frames
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Framing error: {0}")]
    FramingError(String),

    #[error("Frame of {size} bytes exceeds max frame size {max}")]
    MaxFrameSizeExceeded { size: usize, max: usize },

    #[error("Max frame size {0} is out of range")]
    InvalidMaxFrameSize(u32),

    #[error("Unknown method {class_id}.{method_id}")]
    UnknownMethod { class_id: u16, method_id: u16 },
}

impl Error {
    pub(crate) fn framing(msg: impl Into<String>) -> Self {
        Self::FramingError(msg.into())
    }

    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        Self::DecodeError(msg.into())
    }
}
