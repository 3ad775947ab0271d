use std::{
    io,
    panic::{AssertUnwindSafe, catch_unwind, resume_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use crossbeam_channel::{Receiver as TaskQueue, Sender, unbounded};
use mio::{Events, Poll, Token, Waker, event::Event};
use tether_comm::{Drain, FifoBuffer, Fill, Lane, WorkerPool};
use tracing::{debug, error, info, trace, warn};

use crate::{
    capability::Capability,
    chunk::{CHUNK_HEADER_LEN, ChunkHeader},
    config::HubConfig,
    error::HubError,
    hub::transport::{
        ByteStreams, Endpoint, TransportCore, TransportHandle, TransportId, set_socket_buf_size,
    },
};

/// Token reserved for the wakeup primitive behind task injection.
const WAKER: Token = Token(usize::MAX);

/// Work other threads inject into the selector loop. Draining the queue at
/// the top of every iteration is the only way registration state is mutated
/// from outside.
pub(crate) enum SelectorTask {
    Register { core: Arc<TransportCore>, streams: ByteStreams },
    Reregister(TransportId),
    CloseRead(TransportId),
}

#[derive(Default)]
struct HubShared {
    running: AtomicBool,
    closed: AtomicBool,
    next_transport: AtomicU64,
}

struct Registered {
    core: Arc<TransportCore>,
    endpoint: Endpoint,
}

/// Cloneable front door to a running [`Hub`]. Creates transports and injects
/// selector tasks from any thread.
#[derive(Clone)]
pub struct HubHandle {
    injector: Sender<SelectorTask>,
    waker: Arc<Waker>,
    pool: Arc<dyn WorkerPool>,
    config: HubConfig,
    shared: Arc<HubShared>,
}

impl HubHandle {
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stops the selector loop. Registered transports are aborted with
    /// [`HubError::HubClosed`] before `run` returns. Idempotent.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(%e, "hub wakeup failed");
        }
    }

    /// Builds a hub-managed transport over the given byte streams: Mono when
    /// one socket backs both directions, Dual for a pipe pair.
    ///
    /// Fails with [`HubError::NotRunning`] before the selector loop starts
    /// and with [`HubError::CapabilityMismatch`] when the remote cannot speak
    /// the chunked binary protocol; in the latter case the caller falls back
    /// to a transport the hub does not manage.
    pub fn make_transport(
        &self,
        streams: ByteStreams,
        capability: Capability,
    ) -> Result<TransportHandle, HubError> {
        if !self.is_running() {
            return Err(HubError::NotRunning);
        }
        if !capability.supports_chunked_stream() || !capability.supports_binary_stream() {
            return Err(HubError::CapabilityMismatch(capability));
        }
        match &streams {
            ByteStreams::Duplex(stream) => {
                stream.set_nodelay(true)?;
                if let Some(size) = self.config.socket_buf_size {
                    set_socket_buf_size(stream, size);
                }
            }
            ByteStreams::Pair { reader, writer } => {
                reader.set_nonblocking(true)?;
                writer.set_nonblocking(true)?;
            }
        }
        let id = TransportId(self.shared.next_transport.fetch_add(1, Ordering::Relaxed));
        let core = Arc::new(TransportCore::new(
            id,
            capability,
            FifoBuffer::new(self.config.read_buf_initial, self.config.read_buf_limit),
            FifoBuffer::new(self.config.write_buf_initial, self.config.write_buf_limit),
            Lane::new(Arc::clone(&self.pool)),
        ));
        self.schedule(SelectorTask::Register { core: Arc::clone(&core), streams });
        Ok(TransportHandle::new(core, self.clone()))
    }

    pub(crate) fn schedule(&self, task: SelectorTask) {
        if self.injector.send(task).is_err() {
            warn!("hub is gone, selector task dropped");
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!(%e, "hub wakeup failed");
        }
    }

    pub(crate) fn config(&self) -> &HubConfig {
        &self.config
    }
}

/// Multiplexing I/O hub. One selector thread services every registered
/// transport: it pumps bytes between OS handles and the per-transport
/// buffers, reassembles chunked packets and dispatches them in arrival order
/// on each transport's lane.
///
/// Construct idle, hand out [`HubHandle`]s, then let a dedicated thread call
/// [`run`](Self::run).
pub struct Hub {
    events: Events,
    inner: Selector,
}

struct Selector {
    poll: Poll,
    waker: Arc<Waker>,
    tasks: TaskQueue<SelectorTask>,
    injector: Sender<SelectorTask>,
    pool: Arc<dyn WorkerPool>,
    config: HubConfig,
    conns: Vec<Registered>,
    next_token: usize,
    generation: u64,
    shared: Arc<HubShared>,
    loop_thread: Option<ThreadId>,
}

impl Hub {
    pub fn new(pool: Arc<dyn WorkerPool>, config: HubConfig) -> Result<Self, HubError> {
        config.validate()?;
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (injector, tasks) = unbounded();
        Ok(Self {
            events: Events::with_capacity(config.events_capacity),
            inner: Selector {
                poll,
                waker,
                tasks,
                injector,
                pool,
                config,
                conns: Vec::new(),
                next_token: 0,
                generation: 0,
                shared: Arc::new(HubShared::default()),
                loop_thread: None,
            },
        })
    }

    pub fn handle(&self) -> HubHandle {
        HubHandle {
            injector: self.inner.injector.clone(),
            waker: Arc::clone(&self.inner.waker),
            pool: Arc::clone(&self.inner.pool),
            config: self.inner.config,
            shared: Arc::clone(&self.inner.shared),
        }
    }

    /// Runs the selector loop on the calling thread until
    /// [`HubHandle::shutdown`] or a fatal selector error. Per-transport
    /// failures abort only that transport; a failing `poll` aborts every
    /// transport and returns the error; a panic aborts every transport and
    /// resumes unwinding.
    pub fn run(&mut self) -> io::Result<()> {
        self.inner.loop_thread = Some(thread::current().id());
        self.inner.shared.running.store(true, Ordering::Release);
        info!("selector loop running");
        let outcome = catch_unwind(AssertUnwindSafe(|| self.drive()));
        self.inner.shared.running.store(false, Ordering::Release);
        match outcome {
            Ok(result) => result,
            Err(panic) => {
                self.inner.abort_all(&mut || HubError::HubClosed);
                resume_unwind(panic);
            }
        }
    }

    fn drive(&mut self) -> io::Result<()> {
        loop {
            self.inner.drain_tasks();
            if self.inner.shared.closed.load(Ordering::Acquire) {
                self.inner.abort_all(&mut || HubError::HubClosed);
                info!("selector loop closed");
                return Ok(());
            }
            self.inner.bump_generation();
            if let Err(e) = self.inner.poll.poll(&mut self.events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(%e, "selector poll failed, aborting all transports");
                self.inner
                    .abort_all(&mut || HubError::Io(io::Error::new(e.kind(), "selector failed")));
                return Err(e);
            }
            for event in self.events.iter() {
                self.inner.handle_event(event);
            }
        }
    }
}

impl Selector {
    /// Runs every queued task, containing failures so one bad task cannot
    /// kill the loop.
    fn drain_tasks(&mut self) {
        while let Ok(task) = self.tasks.try_recv() {
            self.run_task(task);
        }
    }

    fn run_task(&mut self, task: SelectorTask) {
        match task {
            SelectorTask::Register { core, streams } => self.register(core, streams),
            SelectorTask::Reregister(id) => self.reregister(id),
            SelectorTask::CloseRead(id) => self.close_read(id),
        }
    }

    fn register(&mut self, core: Arc<TransportCore>, streams: ByteStreams) {
        self.assert_selector_thread();
        let endpoint = match streams {
            ByteStreams::Duplex(stream) => {
                let token = Token(self.next_token);
                self.next_token += 1;
                Endpoint::Mono { stream, token, interest: None, read_open: true, write_open: true }
            }
            ByteStreams::Pair { reader, writer } => {
                let read_token = Token(self.next_token);
                let write_token = Token(self.next_token + 1);
                self.next_token += 2;
                Endpoint::Dual {
                    reader: Some(reader),
                    read_token,
                    read_registered: false,
                    writer: Some(writer),
                    write_token,
                    write_registered: false,
                }
            }
        };
        let id = core.id;
        debug!(?id, "transport registered");
        self.conns.push(Registered { core, endpoint });
        self.reregister(id);
    }

    fn position(&self, id: TransportId) -> Option<usize> {
        self.conns.iter().position(|c| c.core.id == id)
    }

    fn reregister(&mut self, id: TransportId) {
        self.assert_selector_thread();
        let Some(idx) = self.position(id) else {
            trace!(?id, "reregister for a transport that is gone");
            return;
        };
        self.apply_interest(idx);
    }

    fn close_read(&mut self, id: TransportId) {
        self.assert_selector_thread();
        let Some(idx) = self.position(id) else {
            trace!(?id, "close read for a transport that is gone");
            return;
        };
        let conn = &mut self.conns[idx];
        conn.endpoint.close_read(self.poll.registry());
        conn.core.rb.close();
        self.apply_interest(idx);
    }

    fn handle_event(&mut self, event: &Event) {
        if event.token() == WAKER {
            return;
        }
        let mut found = None;
        for (idx, conn) in self.conns.iter().enumerate() {
            if let Some(dir) = conn.endpoint.direction_of(event.token()) {
                found = Some((idx, dir));
                break;
            }
        }
        let Some((idx, dir)) = found else {
            // Keys cancelled mid-batch can leave stale events behind.
            trace!(token = ?event.token(), "event for a cancelled key");
            return;
        };
        // Error conditions surface through the read or write attempt itself.
        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        let writable = event.is_writable() || event.is_write_closed() || event.is_error();
        if readable && dir.reads() {
            if let Err(e) = self.on_readable(idx) {
                self.abort(idx, e);
                return;
            }
        }
        if writable && dir.writes() {
            if let Err(e) = self.on_writable(idx) {
                self.abort(idx, e);
                return;
            }
        }
        self.apply_interest(idx);
    }

    /// Pumps the read side until the handle would block, reassembling as it
    /// goes. Readiness is edge triggered, so stopping early while bytes are
    /// still pending would stall the transport.
    fn on_readable(&mut self, idx: usize) -> Result<(), HubError> {
        self.assert_selector_thread();
        // A locally closed read side stays quiet even if stray readiness
        // still points here; only a remote EOF observed below may raise the
        // terminal event.
        if !self.conns[idx].endpoint.read_open() {
            return Ok(());
        }
        loop {
            let outcome = {
                let conn = &mut self.conns[idx];
                conn.endpoint.fill(&conn.core.rb)?
            };
            if outcome == Fill::Eof {
                let conn = &mut self.conns[idx];
                debug!(id = ?conn.core.id, "remote EOF");
                conn.endpoint.close_read(self.poll.registry());
                conn.core.rb.close();
            }
            self.reassemble(idx);
            let core = &self.conns[idx].core;
            if core.rb.writable() == 0 && core.rb.readable() > 0 {
                return Err(HubError::CommandOverflow { limit: core.rb.limit() });
            }
            if core.rb.is_closed() {
                core.enqueue_eof();
                return Ok(());
            }
            if outcome == Fill::Bytes(0) {
                return Ok(());
            }
        }
    }

    fn on_writable(&mut self, idx: usize) -> Result<(), HubError> {
        self.assert_selector_thread();
        let conn = &mut self.conns[idx];
        match conn.endpoint.drain(&conn.core.wb)? {
            Drain::Finished => {
                debug!(id = ?conn.core.id, "write side drained, closing");
                conn.endpoint.close_write(self.poll.registry());
            }
            Drain::Flushed(_) => {}
        }
        Ok(())
    }

    /// Extracts every complete packet sitting in the read buffer and hands
    /// each to the transport's lane, in arrival order. A trailing partial
    /// packet is left untouched for the next readiness event.
    fn reassemble(&self, idx: usize) {
        let core = &self.conns[idx].core;
        while let Some(packet_size) = scan_packet(&core.rb) {
            core.dispatch_packet(consume_packet(&core.rb, packet_size));
        }
    }

    /// Recomputes the interest set from what the transport wants right now
    /// and retires the registration once both sides are closed.
    fn apply_interest(&mut self, idx: usize) {
        self.assert_selector_thread();
        let want_read = self.conns[idx].core.wants_to_read();
        let want_write = self.conns[idx].core.wants_to_write();
        let applied =
            self.conns[idx].endpoint.update_interest(self.poll.registry(), want_read, want_write);
        if let Err(e) = applied {
            self.abort(idx, HubError::Io(e));
            return;
        }
        if self.conns[idx].endpoint.fully_closed() {
            let conn = self.conns.swap_remove(idx);
            conn.core.clear_owner();
            debug!(id = ?conn.core.id, "transport retired");
        }
    }

    /// Tears the transport down: closes both sides ignoring handle errors,
    /// wakes anyone blocked on its buffers and sequences the terminal
    /// callback behind the packets already dispatched.
    fn abort(&mut self, idx: usize, cause: HubError) {
        self.assert_selector_thread();
        let mut conn = self.conns.swap_remove(idx);
        warn!(id = ?conn.core.id, %cause, "aborting transport");
        conn.endpoint.close_both(self.poll.registry());
        conn.core.rb.close();
        conn.core.wb.close();
        conn.core.clear_owner();
        conn.core.sequence_terminate(HubError::Aborted { source: Box::new(cause) });
    }

    fn abort_all(&mut self, cause: &mut dyn FnMut() -> HubError) {
        while !self.conns.is_empty() {
            let last = self.conns.len() - 1;
            self.abort(last, cause());
        }
    }

    /// Diagnostic only. The thread renames itself each iteration with the
    /// registered key count and a generation counter.
    fn bump_generation(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        let keys = 1 + self.conns.iter().map(|c| c.endpoint.registered_keys()).sum::<usize>();
        trace!(keys, generation = self.generation, "selector iteration");
        #[cfg(target_os = "linux")]
        unsafe {
            let name = format!("hub k{keys} g{}\0", self.generation);
            libc::prctl(libc::PR_SET_NAME, name.as_ptr());
        }
    }

    /// Selector-side state must only ever be touched from the loop thread.
    fn assert_selector_thread(&self) {
        assert!(
            self.loop_thread == Some(thread::current().id()),
            "selector-side operation invoked off the selector thread"
        );
    }
}

/// Measures whether a complete packet sits at the head of `rb`, peeking
/// only. Returns its total payload size. A half-present header or a missing
/// tail of the payload leaves the buffer untouched and yields `None`.
fn scan_packet(rb: &FifoBuffer) -> Option<usize> {
    let mut pos = 0_usize;
    let mut packet_size = 0_usize;
    loop {
        let mut header = [0_u8; CHUNK_HEADER_LEN];
        if rb.peek(pos, &mut header) < CHUNK_HEADER_LEN {
            return None;
        }
        let header = ChunkHeader::parse(header);
        pos += CHUNK_HEADER_LEN + header.len();
        packet_size += header.len();
        if header.is_last() {
            return (pos <= rb.readable()).then_some(packet_size);
        }
    }
}

/// Consumes one complete packet of `packet_size` payload bytes from `rb`,
/// concatenating chunk payloads. Only call after [`scan_packet`] confirmed
/// the packet is fully present.
fn consume_packet(rb: &FifoBuffer, packet_size: usize) -> Vec<u8> {
    let mut payload = vec![0_u8; packet_size];
    let mut off = 0_usize;
    loop {
        let mut header = [0_u8; CHUNK_HEADER_LEN];
        let got = rb.read(&mut header);
        debug_assert_eq!(got, CHUNK_HEADER_LEN);
        let header = ChunkHeader::parse(header);
        let mut need = header.len();
        while need > 0 {
            let n = rb.read(&mut payload[off..off + need]);
            debug_assert!(n > 0);
            off += n;
            need -= n;
        }
        if header.is_last() {
            debug_assert_eq!(off, packet_size);
            return payload;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fifo_with(bytes: &[u8]) -> FifoBuffer {
        let rb = FifoBuffer::new(16, 1024);
        rb.write(bytes).unwrap();
        rb
    }

    #[test]
    fn scan_finds_single_chunk_packet() {
        let rb = fifo_with(&[0x80, 0x05, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(scan_packet(&rb), Some(5));
        assert_eq!(consume_packet(&rb, 5), b"hello");
        assert_eq!(rb.readable(), 0);
    }

    #[test]
    fn scan_refuses_half_present_header() {
        let rb = fifo_with(&[0x80]);
        assert_eq!(scan_packet(&rb), None);
        assert_eq!(rb.readable(), 1);
    }

    #[test]
    fn scan_refuses_incomplete_payload() {
        let rb = fifo_with(&[0x80, 0x05, b'h', b'e']);
        assert_eq!(scan_packet(&rb), None);
        assert_eq!(rb.readable(), 4);
    }

    #[test]
    fn scan_waits_for_the_last_chunk() {
        let rb = fifo_with(&[0x00, 0x02, 1, 2]);
        assert_eq!(scan_packet(&rb), None);
        rb.write(&[0x80, 0x01, 3]).unwrap();
        assert_eq!(scan_packet(&rb), Some(3));
        assert_eq!(consume_packet(&rb, 3), vec![1, 2, 3]);
    }

    #[test]
    fn trailing_partial_packet_is_preserved() {
        let rb = fifo_with(&[0x80, 0x01, 9, 0x00, 0x02, 7]);
        assert_eq!(scan_packet(&rb), Some(1));
        assert_eq!(consume_packet(&rb, 1), vec![9]);
        assert_eq!(scan_packet(&rb), None);
        assert_eq!(rb.readable(), 3);
    }

    #[test]
    fn zero_length_terminator_closes_a_full_frame() {
        let rb = fifo_with(&[0x00, 0x04, 0, 1, 2, 3, 0x80, 0x00]);
        assert_eq!(scan_packet(&rb), Some(4));
        assert_eq!(consume_packet(&rb, 4), vec![0, 1, 2, 3]);
    }

    #[test]
    fn empty_packet_is_legal() {
        let rb = fifo_with(&[0x80, 0x00]);
        assert_eq!(scan_packet(&rb), Some(0));
        assert_eq!(consume_packet(&rb, 0), Vec::<u8>::new());
    }

    #[test]
    fn framing_roundtrips_at_odd_frame_sizes() {
        let message: Vec<u8> = (0..1000_u32).map(|i| (i % 251) as u8).collect();
        for frame in [1_usize, 7, 250, 999, 1000, 32767] {
            let rb = FifoBuffer::new(16, 64 * 1024);
            let mut rest = message.as_slice();
            loop {
                let take = rest.len().min(frame);
                let (chunk, tail) = rest.split_at(take);
                rb.write(&ChunkHeader::pack(take, !tail.is_empty())).unwrap();
                rb.write(chunk).unwrap();
                rest = tail;
                if rest.is_empty() {
                    break;
                }
            }
            let size = scan_packet(&rb).expect("complete packet");
            assert_eq!(size, message.len());
            assert_eq!(consume_packet(&rb, size), message);
            assert_eq!(rb.readable(), 0);
        }
    }
}
