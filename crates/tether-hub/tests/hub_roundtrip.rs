use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver as ChanReceiver, Sender, unbounded};
use tether_comm::FixedPool;
use tether_hub::{
    ByteStreams, Capability, Hub, HubConfig, HubError, HubHandle, Receiver, TransportHandle,
};

const TIMEOUT: Duration = Duration::from_secs(5);

enum Delivery {
    Packet(Vec<u8>),
    Terminated(HubError),
}

struct ChannelReceiver(Sender<Delivery>);

impl Receiver for ChannelReceiver {
    fn handle(&self, packet: Vec<u8>) {
        let _ = self.0.send(Delivery::Packet(packet));
    }

    fn terminate(&self, err: HubError) {
        let _ = self.0.send(Delivery::Terminated(err));
    }
}

fn start_hub(config: HubConfig) -> (HubHandle, thread::JoinHandle<std::io::Result<()>>) {
    let pool = Arc::new(FixedPool::new(4));
    let mut hub = Hub::new(pool, config).expect("failed to build hub");
    let handle = hub.handle();
    let join = thread::spawn(move || hub.run());
    while !handle.is_running() {
        thread::sleep(Duration::from_millis(1));
    }
    (handle, join)
}

/// Loopback socket pair with the hub side wrapped as a Mono transport.
fn tcp_transport(hub: &HubHandle) -> (TransportHandle, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind test listener");
    let addr = listener.local_addr().expect("failed to fetch listener addr");
    let peer = TcpStream::connect(addr).expect("failed to connect test peer");
    let (local, _) = listener.accept().expect("failed to accept connection");
    local.set_nonblocking(true).expect("failed to set nonblocking");
    let stream = mio::net::TcpStream::from_std(local);
    let transport = hub
        .make_transport(ByteStreams::Duplex(stream), Capability::all())
        .expect("failed to make transport");
    (transport, peer)
}

fn recording(transport: &TransportHandle) -> ChanReceiver<Delivery> {
    let (tx, rx) = unbounded();
    transport.setup(Arc::new(ChannelReceiver(tx)));
    rx
}

fn expect_packet(rx: &ChanReceiver<Delivery>) -> Vec<u8> {
    match rx.recv_timeout(TIMEOUT).expect("no delivery") {
        Delivery::Packet(packet) => packet,
        Delivery::Terminated(err) => panic!("unexpected terminate: {err}"),
    }
}

#[test]
fn single_small_message() {
    let (hub, _join) = start_hub(HubConfig::default());
    let (transport, mut peer) = tcp_transport(&hub);
    let rx = recording(&transport);

    peer.write_all(&[0x80, 0x05, b'h', b'e', b'l', b'l', b'o']).unwrap();

    assert_eq!(expect_packet(&rx), b"hello");
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err(), "spurious second delivery");
    hub.shutdown();
}

#[test]
fn multi_chunk_message_reassembles() {
    let (hub, _join) = start_hub(HubConfig::default().with_frame_size(4));
    let (transport, mut peer) = tcp_transport(&hub);
    let rx = recording(&transport);

    peer.write_all(&[0x00, 0x04, 0, 1, 2, 3, 0x00, 0x04, 4, 5, 6, 7, 0x80, 0x02, 8, 9]).unwrap();

    assert_eq!(expect_packet(&rx), vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    hub.shutdown();
}

#[test]
fn writer_fragments_at_frame_size() {
    let (hub, _join) = start_hub(HubConfig::default().with_frame_size(4));
    let (transport, mut peer) = tcp_transport(&hub);

    transport.write_block(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();

    let mut wire = [0_u8; 16];
    peer.read_exact(&mut wire).unwrap();
    assert_eq!(wire, [0x00, 0x04, 0, 1, 2, 3, 0x00, 0x04, 4, 5, 6, 7, 0x80, 0x02, 8, 9]);
    hub.shutdown();
}

#[test]
fn full_frame_chunk_with_zero_length_terminator() {
    let (hub, _join) = start_hub(HubConfig::default().with_frame_size(4));
    let (transport, mut peer) = tcp_transport(&hub);
    let rx = recording(&transport);

    peer.write_all(&[0x00, 0x04, 10, 11, 12, 13, 0x80, 0x00]).unwrap();

    assert_eq!(expect_packet(&rx), vec![10, 11, 12, 13]);
    hub.shutdown();
}

#[test]
fn empty_message_roundtrips() {
    let (hub, _join) = start_hub(HubConfig::default());
    let (transport, mut peer) = tcp_transport(&hub);
    let rx = recording(&transport);

    transport.write_block(&[]).unwrap();
    let mut wire = [0_u8; 2];
    peer.read_exact(&mut wire).unwrap();
    assert_eq!(wire, [0x80, 0x00]);

    peer.write_all(&[0x80, 0x00]).unwrap();
    assert_eq!(expect_packet(&rx), Vec::<u8>::new());
    hub.shutdown();
}

#[test]
fn split_header_does_not_corrupt_reassembly() {
    let (hub, _join) = start_hub(HubConfig::default());
    let (transport, mut peer) = tcp_transport(&hub);
    let rx = recording(&transport);

    peer.write_all(&[0x80]).unwrap();
    peer.flush().unwrap();
    thread::sleep(Duration::from_millis(100));
    peer.write_all(&[0x03, 7, 8, 9]).unwrap();

    assert_eq!(expect_packet(&rx), vec![7, 8, 9]);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err(), "spurious second delivery");
    hub.shutdown();
}

#[test]
fn transports_keep_their_lanes_apart() {
    let (hub, _join) = start_hub(HubConfig::default());
    let (transport_a, mut peer_a) = tcp_transport(&hub);
    let (transport_b, mut peer_b) = tcp_transport(&hub);
    let rx_a = recording(&transport_a);
    let rx_b = recording(&transport_b);

    peer_a.write_all(&[0x80, 0x01, b'A']).unwrap();
    peer_b.write_all(&[0x80, 0x02, b'B', b'B']).unwrap();

    assert_eq!(expect_packet(&rx_a), b"A");
    assert_eq!(expect_packet(&rx_b), b"BB");
    assert!(rx_a.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(rx_b.recv_timeout(Duration::from_millis(200)).is_err());
    hub.shutdown();
}

#[test]
fn many_messages_arrive_in_order() {
    let (hub, _join) = start_hub(HubConfig::default());
    let (transport, mut peer) = tcp_transport(&hub);
    let rx = recording(&transport);

    let mut wire = Vec::new();
    for i in 0..200_u16 {
        let payload = i.to_be_bytes();
        wire.extend_from_slice(&[0x80, 0x02]);
        wire.extend_from_slice(&payload);
    }
    peer.write_all(&wire).unwrap();

    for i in 0..200_u16 {
        assert_eq!(expect_packet(&rx), i.to_be_bytes());
    }
    hub.shutdown();
}
