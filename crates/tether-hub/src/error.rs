use std::io;

use thiserror::Error;

use crate::capability::Capability;

/// Errors surfaced by the hub, both to callers and through
/// [`crate::Receiver::terminate`].
#[derive(Debug, Error)]
pub enum HubError {
    /// The transport was torn down by the selector loop. `source` carries
    /// what went wrong.
    #[error("transport aborted: {source}")]
    Aborted {
        #[source]
        source: Box<HubError>,
    },
    /// The read buffer hit its hard cap without a complete packet in view.
    #[error("command buffer overflow: {limit} byte read buffer saturated without a complete packet")]
    CommandOverflow { limit: usize },
    /// The remote side closed the stream outside a locally initiated close.
    #[error("unexpected EOF from the remote side")]
    UnexpectedEof,
    /// The hub selector was shut down while the transport was registered.
    #[error("hub selector closed")]
    HubClosed,
    /// A transport was requested before the selector loop started.
    #[error("hub is not running")]
    NotRunning,
    /// The remote endpoint cannot speak the chunked binary protocol; the
    /// caller should fall back to a transport the hub does not manage.
    #[error("remote capability {0:?} lacks chunked binary stream support")]
    CapabilityMismatch(Capability),
    /// The write side of the transport is already closed.
    #[error("transport write side closed")]
    StreamClosed,
    #[error("invalid hub config: {0}")]
    Config(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}
