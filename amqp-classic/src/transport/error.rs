use std::io;

use crate::framing;

/// Errors raised by the [`Transport`](super::Transport)
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    #[error("Idle timeout")]
    IdleTimeout,

    #[error(transparent)]
    Framing(framing::Error),
}

impl From<framing::Error> for Error {
    fn from(err: framing::Error) -> Self {
        match err {
            framing::Error::Io(err) => Self::Io(err),
            other => Self::Framing(other),
        }
    }
}
