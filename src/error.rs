use thiserror::Error;

/// Errors that can terminate or degrade the packet loop.
///
/// Socket-open failure and receive I/O errors are fatal (the loop returns
/// `Err`). Everything else (send failures, unreachable notifications,
/// engine hiccups) is logged and the loop continues past it.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("could not open socket set (af={family:?}, port={port})")]
    SocketOpen { family: crate::types::Family, port: u16 },

    #[error("fatal receive error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine error: {0}")]
    Engine(String),
}

pub type Result<T> = std::result::Result<T, LoopError>;
