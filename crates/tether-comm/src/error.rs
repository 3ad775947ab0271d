use thiserror::Error;

/// Returned by blocking writes into a [`crate::FifoBuffer`] that was closed
/// before or while the writer was waiting for space.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("buffer closed")]
pub struct BufferClosed;
