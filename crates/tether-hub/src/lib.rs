//! Multiplexing I/O hub for a remoting runtime. A single selector thread
//! services many chunked byte-oriented connections: non-blocking reads and
//! writes against per-connection buffers with backpressure, reassembly of
//! length-prefixed chunks into whole packets and ordered dispatch onto a
//! shared worker pool.

mod capability;
mod chunk;
mod config;
mod error;
mod hub;

pub use capability::Capability;
pub use chunk::{CHUNK_HEADER_LEN, ChunkHeader, MAX_CHUNK_LEN};
pub use config::{DEFAULT_FRAME_SIZE, HubConfig};
pub use error::HubError;
pub use hub::{ByteStreams, Hub, HubHandle, Receiver, TransportHandle, TransportOwner};
