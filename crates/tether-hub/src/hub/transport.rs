use std::{
    fmt, io,
    net::Shutdown,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use mio::{Interest, Registry, Token, net::TcpStream, unix::pipe};
use tether_comm::{Drain, FifoBuffer, Fill, Lane};
use tracing::{debug, trace, warn};

use crate::{
    capability::Capability,
    chunk::ChunkHeader,
    error::HubError,
    hub::selector::{HubHandle, SelectorTask},
};

/// Stable identity of a transport inside its hub, used by selector tasks to
/// find the registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransportId(pub(crate) u64);

/// Consumer of reassembled packets. Both callbacks run on the worker pool
/// through the transport's lane, never on the selector thread. `terminate`
/// is called at most once and nothing follows it.
pub trait Receiver: Send + Sync {
    fn handle(&self, packet: Vec<u8>);
    fn terminate(&self, err: HubError);
}

/// Back-reference to the remoting channel owning a transport. Queried when
/// the remote side reaches EOF: a channel that is already closing locally
/// suppresses the terminal notification.
pub trait TransportOwner: Send + Sync {
    fn is_closing(&self) -> bool;
}

/// Byte streams handed to the builder. `Duplex` is one socket backing both
/// directions, `Pair` two distinct pipe ends.
pub enum ByteStreams {
    Duplex(TcpStream),
    Pair { reader: pipe::Receiver, writer: pipe::Sender },
}

/// Per-connection state shared between the selector loop, the application
/// threads and the dispatch lane.
pub(crate) struct TransportCore {
    pub(crate) id: TransportId,
    capability: Capability,
    pub(crate) rb: FifoBuffer,
    pub(crate) wb: FifoBuffer,
    receiver: Mutex<Option<Arc<dyn Receiver>>>,
    pub(crate) lane: Lane,
    owner: Arc<Mutex<Option<Weak<dyn TransportOwner>>>>,
    /// Set once the terminal callback ran; gates every later dispatch.
    terminated: Arc<AtomicBool>,
    /// Set once the EOF event was put on the lane.
    eof_queued: AtomicBool,
}

impl TransportCore {
    pub(crate) fn new(id: TransportId, capability: Capability, rb: FifoBuffer, wb: FifoBuffer, lane: Lane) -> Self {
        Self {
            id,
            capability,
            rb,
            wb,
            receiver: Mutex::new(None),
            lane,
            owner: Arc::new(Mutex::new(None)),
            terminated: Arc::new(AtomicBool::new(false)),
            eof_queued: AtomicBool::new(false),
        }
    }

    fn receiver(&self) -> Option<Arc<dyn Receiver>> {
        self.receiver.lock().unwrap().clone()
    }

    pub(crate) fn wants_to_read(&self) -> bool {
        self.receiver.lock().unwrap().is_some() && self.rb.writable() > 0
    }

    /// Write interest also covers a closed `wb` so the loop observes the
    /// drained-and-closed sentinel and half-closes the handle.
    pub(crate) fn wants_to_write(&self) -> bool {
        self.wb.readable() > 0 || self.wb.is_closed()
    }

    /// Queues one reassembled packet on the lane, in selector submission
    /// order.
    pub(crate) fn dispatch_packet(&self, payload: Vec<u8>) {
        let Some(receiver) = self.receiver() else {
            warn!(id = ?self.id, "packet reassembled before setup, dropped");
            return;
        };
        let terminated = Arc::clone(&self.terminated);
        self.lane.submit(Box::new(move || {
            if !terminated.load(Ordering::Acquire) {
                receiver.handle(payload);
            }
        }));
    }

    /// Queues the terminal EOF notification, once, sequenced after every
    /// packet already on the lane. Suppressed at run time when the owning
    /// channel reports it is closing.
    pub(crate) fn enqueue_eof(&self) {
        if self.eof_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let receiver = self.receiver();
        let terminated = Arc::clone(&self.terminated);
        let owner = Arc::clone(&self.owner);
        self.lane.submit(Box::new(move || {
            let closing = owner
                .lock()
                .unwrap()
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|o| o.is_closing());
            if closing {
                trace!("remote EOF during local close, suppressed");
                return;
            }
            run_terminate(receiver, &terminated, &owner, HubError::UnexpectedEof);
        }));
    }

    /// Queues the terminal error notification behind the packets already on
    /// the lane.
    pub(crate) fn sequence_terminate(&self, err: HubError) {
        let receiver = self.receiver();
        let terminated = Arc::clone(&self.terminated);
        let owner = Arc::clone(&self.owner);
        self.lane.submit(Box::new(move || {
            run_terminate(receiver, &terminated, &owner, err);
        }));
    }

    /// Drops the owner relation once the transport is done.
    pub(crate) fn clear_owner(&self) {
        self.owner.lock().unwrap().take();
    }

    fn set_receiver(&self, receiver: Arc<dyn Receiver>) -> bool {
        let mut slot = self.receiver.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(receiver);
        true
    }
}

fn run_terminate(
    receiver: Option<Arc<dyn Receiver>>,
    terminated: &AtomicBool,
    owner: &Mutex<Option<Weak<dyn TransportOwner>>>,
    err: HubError,
) {
    if terminated.swap(true, Ordering::AcqRel) {
        return;
    }
    owner.lock().unwrap().take();
    match receiver {
        Some(receiver) => receiver.terminate(err),
        None => debug!(%err, "transport terminated before setup"),
    }
}

/// Application-facing handle to a hub-managed transport. Cloneable; all
/// methods are callable from any thread except where noted. Concurrent
/// `write_block` calls on one transport must be serialized by the caller.
#[derive(Clone)]
pub struct TransportHandle {
    core: Arc<TransportCore>,
    hub: HubHandle,
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle").field("id", &self.core.id).finish()
    }
}

impl TransportHandle {
    pub(crate) fn new(core: Arc<TransportCore>, hub: HubHandle) -> Self {
        Self { core, hub }
    }

    /// Fragments `data` into chunks of at most the configured frame size and
    /// queues them on the write buffer, blocking while the buffer is at its
    /// hard cap. Empty input becomes a single 0-length terminator chunk.
    ///
    /// Fails with [`HubError::StreamClosed`] once the write side is closed;
    /// a prefix queued before the failure is still transmitted.
    pub fn write_block(&self, data: &[u8]) -> Result<(), HubError> {
        let frame = usize::from(self.hub.config().frame_size);
        let mut rest = data;
        loop {
            let take = rest.len().min(frame);
            let (chunk, tail) = rest.split_at(take);
            let header = ChunkHeader::pack(take, !tail.is_empty());
            self.core.wb.write(&header).map_err(|_| HubError::StreamClosed)?;
            self.core.wb.write(chunk).map_err(|_| HubError::StreamClosed)?;
            // Arm the write side once per chunk. The next chunk may block on
            // the buffer cap, and the selector has to know to drain `wb`
            // while the producer is suspended, or neither ever makes
            // progress.
            self.hub.schedule(SelectorTask::Reregister(self.core.id));
            rest = tail;
            if rest.is_empty() {
                return Ok(());
            }
        }
    }

    /// Installs the receiver and lets the read side arm. Must be called
    /// exactly once; a second call is ignored.
    pub fn setup(&self, receiver: Arc<dyn Receiver>) {
        if !self.core.set_receiver(receiver) {
            debug_assert!(false, "setup called twice");
            warn!(id = ?self.core.id, "setup called twice, ignored");
            return;
        }
        self.hub.schedule(SelectorTask::Reregister(self.core.id));
    }

    /// Closes the write buffer. Queued bytes still flush, then the selector
    /// loop half-closes the write side of the handle.
    pub fn close_write(&self) {
        self.core.wb.close();
        self.hub.schedule(SelectorTask::Reregister(self.core.id));
    }

    /// Asks the selector loop to half-close the read side and close the read
    /// buffer.
    pub fn close_read(&self) {
        self.hub.schedule(SelectorTask::CloseRead(self.core.id));
    }

    pub fn remote_capability(&self) -> Capability {
        self.core.capability
    }

    /// Installs the back-reference to the owning channel. A relation, not an
    /// ownership edge; dropped again when the transport terminates.
    pub fn attach_owner(&self, owner: Weak<dyn TransportOwner>) {
        *self.core.owner.lock().unwrap() = Some(owner);
    }
}

/// Which direction a readiness token stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Both,
    Read,
    Write,
}

impl Direction {
    pub(crate) fn reads(self) -> bool {
        matches!(self, Self::Both | Self::Read)
    }

    pub(crate) fn writes(self) -> bool {
        matches!(self, Self::Both | Self::Write)
    }
}

/// Selector-side endpoint of a transport. `Mono` keeps one duplex socket
/// alive across half-closes via directional shutdown; `Dual` owns two pipe
/// ends that close independently. Only the selector thread touches these.
pub(crate) enum Endpoint {
    Mono {
        stream: TcpStream,
        token: Token,
        /// Interest currently registered with the poll, `None` when the
        /// socket is not registered.
        interest: Option<Interest>,
        read_open: bool,
        write_open: bool,
    },
    Dual {
        reader: Option<pipe::Receiver>,
        read_token: Token,
        read_registered: bool,
        writer: Option<pipe::Sender>,
        write_token: Token,
        write_registered: bool,
    },
}

impl Endpoint {
    pub(crate) fn direction_of(&self, token: Token) -> Option<Direction> {
        match self {
            Self::Mono { token: own, .. } => (token == *own).then_some(Direction::Both),
            Self::Dual { read_token, write_token, .. } => {
                if token == *read_token {
                    Some(Direction::Read)
                } else if token == *write_token {
                    Some(Direction::Write)
                } else {
                    None
                }
            }
        }
    }

    pub(crate) fn read_open(&self) -> bool {
        match self {
            Self::Mono { read_open, .. } => *read_open,
            Self::Dual { reader, .. } => reader.is_some(),
        }
    }

    pub(crate) fn write_open(&self) -> bool {
        match self {
            Self::Mono { write_open, .. } => *write_open,
            Self::Dual { writer, .. } => writer.is_some(),
        }
    }

    pub(crate) fn fully_closed(&self) -> bool {
        !self.read_open() && !self.write_open()
    }

    /// Count of keys this endpoint currently holds in the poll.
    pub(crate) fn registered_keys(&self) -> usize {
        match self {
            Self::Mono { interest, .. } => usize::from(interest.is_some()),
            Self::Dual { read_registered, write_registered, .. } => {
                usize::from(*read_registered) + usize::from(*write_registered)
            }
        }
    }

    /// Pulls readable bytes from the OS handle into `rb`. No-op when the
    /// read side is already closed.
    pub(crate) fn fill(&mut self, rb: &FifoBuffer) -> io::Result<Fill> {
        match self {
            Self::Mono { stream, read_open: true, .. } => rb.fill_from(stream),
            Self::Dual { reader: Some(reader), .. } => rb.fill_from(reader),
            _ => Ok(Fill::Bytes(0)),
        }
    }

    /// Pushes queued bytes from `wb` to the OS handle. No-op when the write
    /// side is already closed.
    pub(crate) fn drain(&mut self, wb: &FifoBuffer) -> io::Result<Drain> {
        match self {
            Self::Mono { stream, write_open: true, .. } => wb.drain_to(stream),
            Self::Dual { writer: Some(writer), .. } => wb.drain_to(writer),
            _ => Ok(Drain::Flushed(0)),
        }
    }

    /// Half-closes the read direction without touching the write direction.
    pub(crate) fn close_read(&mut self, registry: &Registry) {
        match self {
            Self::Mono { stream, read_open, .. } => {
                if *read_open {
                    *read_open = false;
                    if let Err(e) = stream.shutdown(Shutdown::Read) {
                        debug!(%e, "read shutdown");
                    }
                }
            }
            Self::Dual { reader, read_registered, .. } => {
                if let Some(mut r) = reader.take() {
                    if *read_registered {
                        if let Err(e) = registry.deregister(&mut r) {
                            debug!(%e, "reader deregister");
                        }
                        *read_registered = false;
                    }
                }
            }
        }
    }

    /// Half-closes the write direction without touching the read direction.
    pub(crate) fn close_write(&mut self, registry: &Registry) {
        match self {
            Self::Mono { stream, write_open, .. } => {
                if *write_open {
                    *write_open = false;
                    if let Err(e) = stream.shutdown(Shutdown::Write) {
                        debug!(%e, "write shutdown");
                    }
                }
            }
            Self::Dual { writer, write_registered, .. } => {
                if let Some(mut w) = writer.take() {
                    if *write_registered {
                        if let Err(e) = registry.deregister(&mut w) {
                            debug!(%e, "writer deregister");
                        }
                        *write_registered = false;
                    }
                }
            }
        }
    }

    /// Tears down both directions, ignoring handle errors.
    pub(crate) fn close_both(&mut self, registry: &Registry) {
        if let Self::Mono { stream, interest, .. } = self {
            if interest.take().is_some() {
                let _ = registry.deregister(stream);
            }
        }
        self.close_read(registry);
        self.close_write(registry);
    }

    /// Brings the poll registration in line with what the transport wants
    /// right now. Sides with no interest are deregistered so a dormant
    /// transport costs nothing in the selector.
    pub(crate) fn update_interest(
        &mut self,
        registry: &Registry,
        want_read: bool,
        want_write: bool,
    ) -> io::Result<()> {
        match self {
            Self::Mono { stream, token, interest, read_open, write_open } => {
                let desired = desired_interest(want_read && *read_open, want_write && *write_open);
                if desired == *interest {
                    return Ok(());
                }
                match (interest.take(), desired) {
                    (None, Some(want)) => registry.register(stream, *token, want)?,
                    (Some(_), Some(want)) => registry.reregister(stream, *token, want)?,
                    (Some(_), None) => registry.deregister(stream)?,
                    (None, None) => {}
                }
                *interest = desired;
            }
            Self::Dual {
                reader,
                read_token,
                read_registered,
                writer,
                write_token,
                write_registered,
            } => {
                if let Some(r) = reader {
                    let want = want_read;
                    if want != *read_registered {
                        if want {
                            registry.register(r, *read_token, Interest::READABLE)?;
                        } else {
                            registry.deregister(r)?;
                        }
                        *read_registered = want;
                    }
                }
                if let Some(w) = writer {
                    let want = want_write;
                    if want != *write_registered {
                        if want {
                            registry.register(w, *write_token, Interest::WRITABLE)?;
                        } else {
                            registry.deregister(w)?;
                        }
                        *write_registered = want;
                    }
                }
            }
        }
        Ok(())
    }
}

fn desired_interest(read: bool, write: bool) -> Option<Interest> {
    match (read, write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Sets kernel SO_SNDBUF and SO_RCVBUF on a duplex socket.
pub(crate) fn set_socket_buf_size(stream: &TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            std::ptr::from_ref(&size).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            std::ptr::from_ref(&size).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
