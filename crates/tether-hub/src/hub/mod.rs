mod selector;
mod transport;

pub use selector::{Hub, HubHandle};
pub use transport::{ByteStreams, Receiver, TransportHandle, TransportOwner};
