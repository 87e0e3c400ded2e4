use thiserror::Error;

/// Result type local to imgpool-mem.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid size: {size}")]
    InvalidSize { size: usize },

    #[error("pool hard cap violation: hard cap = {hard_cap}, used = {used}, free = {free}, requested = {requested}")]
    PoolSizeViolation {
        hard_cap: usize,
        used: usize,
        free: usize,
        requested: usize,
    },

    #[error("allocation failed for {bytes} bytes (tag '{tag}')")]
    AllocFailed { tag: &'static str, bytes: usize },

    /// Access to a buffer whose reference was already closed.
    #[error("buffer already closed")]
    Closed,

    /// Access to an output stream that was already closed.
    #[error("stream already closed")]
    InvalidStream,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("too many bitmaps for the bitmap counter")]
    TooManyBitmaps,

    #[error("pool invariant failed: {0}")]
    Invariant(String),

    #[error(transparent)]
    Core(#[from] imgpool_core::error::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Lift a core error, keeping a closed reference as `Closed`.
    pub(crate) fn from_core(e: imgpool_core::error::Error) -> Self {
        match e {
            imgpool_core::error::Error::Closed => Error::Closed,
            other => Error::Core(other),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io) => io,
            Error::InvalidArgument(_) | Error::InvalidSize { .. } => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
            }
            Error::PoolSizeViolation { .. } | Error::AllocFailed { .. } => {
                std::io::Error::new(std::io::ErrorKind::OutOfMemory, e)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}
