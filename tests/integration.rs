//! End-to-end exercises of the full connect -> send/receive -> close flow over the in-crate
//! test doubles, the way this codebase's own integration tests drive a full channel lifecycle
//! against a lossy test double rather than only unit-testing each layer in isolation.
use addr::{Port, VirtualAddress, VirtualIp};
use net::{Fabric, FabricNetwork, LossyNetwork};
use segment::Segment;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use transport::{ReliableConnection, ReliableTransport, MSS};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn vip(label: &str) -> VirtualIp {
    VirtualIp::from(label)
}

fn connect_pair(
    fabric: &Arc<Fabric<Segment>>,
    a_addr: VirtualAddress,
    b_addr: VirtualAddress,
) -> (
    Arc<ReliableConnection<FabricNetwork>>,
    Arc<ReliableConnection<FabricNetwork>>,
) {
    let transport_a = ReliableTransport::with_timeout(
        FabricNetwork::new(fabric.clone(), a_addr.vip.clone()),
        a_addr.clone(),
        Duration::from_millis(30),
    );
    let transport_b = ReliableTransport::with_timeout(
        FabricNetwork::new(fabric.clone(), b_addr.vip.clone()),
        b_addr.clone(),
        Duration::from_millis(30),
    );

    let conn_a = transport_a.connect(b_addr);
    let connector = thread::spawn({
        let conn_a = conn_a.clone();
        move || conn_a.connect()
    });
    let conn_b = transport_b.accept();
    conn_b.accept();
    connector.join().unwrap();

    (conn_a, conn_b)
}

#[test]
fn round_trip_across_representative_sizes() {
    init_logging();
    let fabric: Arc<Fabric<Segment>> = Arc::new(Fabric::new());
    let a_addr = VirtualAddress::new(vip("h1"), Port(10));
    let b_addr = VirtualAddress::new(vip("h2"), Port(20));
    let (conn_a, conn_b) = connect_pair(&fabric, a_addr, b_addr);

    for len in [0, 1, MSS - 1, MSS, MSS + 1, 10 * MSS] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let sender = {
            let conn_a = conn_a.clone();
            thread::spawn(move || conn_a.send(&payload))
        };
        let received = conn_b.receive().expect("connection closed unexpectedly");
        assert_eq!(received, expected, "mismatch at length {}", len);
        sender.join().unwrap();
    }
}

#[test]
fn round_trip_survives_a_lossy_channel() {
    init_logging();
    let fabric: Arc<Fabric<Segment>> = Arc::new(Fabric::new());
    let a_addr = VirtualAddress::new(vip("h1"), Port(10));
    let b_addr = VirtualAddress::new(vip("h2"), Port(20));

    let transport_a = ReliableTransport::with_timeout(
        LossyNetwork::new(FabricNetwork::new(fabric.clone(), a_addr.vip.clone()), 0.3),
        a_addr.clone(),
        Duration::from_millis(15),
    );
    let transport_b = ReliableTransport::with_timeout(
        LossyNetwork::new(FabricNetwork::new(fabric.clone(), b_addr.vip.clone()), 0.3),
        b_addr.clone(),
        Duration::from_millis(15),
    );

    let conn_a = transport_a.connect(b_addr);
    let connector = thread::spawn({
        let conn_a = conn_a.clone();
        move || conn_a.connect()
    });
    let conn_b = transport_b.accept();
    conn_b.accept();
    connector.join().unwrap();

    let payload = vec![42u8; 3 * MSS];
    let expected = payload.clone();
    let sender = thread::spawn(move || conn_a.send(&payload));
    let received = conn_b.receive().expect("lossy channel should still deliver eventually");
    assert_eq!(received, expected);
    sender.join().unwrap();
}

/// Both ends call `close()` at roughly the same time; neither the passive nor the active side
/// should hang, and the connection detaches from both transports exactly once.
#[test]
fn close_race_neither_side_hangs() {
    init_logging();
    let fabric: Arc<Fabric<Segment>> = Arc::new(Fabric::new());
    let a_addr = VirtualAddress::new(vip("h1"), Port(10));
    let b_addr = VirtualAddress::new(vip("h2"), Port(20));
    let (conn_a, conn_b) = connect_pair(&fabric, a_addr, b_addr);

    let closer_a = thread::spawn(move || conn_a.close());
    let closer_b = thread::spawn(move || conn_b.close());

    closer_a.join().unwrap();
    closer_b.join().unwrap();
}

#[test]
fn abort_unblocks_a_pending_receive() {
    init_logging();
    let fabric: Arc<Fabric<Segment>> = Arc::new(Fabric::new());
    let a_addr = VirtualAddress::new(vip("h1"), Port(10));
    let b_addr = VirtualAddress::new(vip("h2"), Port(20));
    let (conn_a, conn_b) = connect_pair(&fabric, a_addr, b_addr);
    drop(conn_a);

    let receiver = thread::spawn({
        let conn_b = conn_b.clone();
        move || conn_b.receive()
    });
    thread::sleep(Duration::from_millis(20));
    conn_b.abort();

    assert_eq!(receiver.join().unwrap(), None);
}

/// `conn_b` never calls `receive()`, so it never acks a data chunk: `conn_a`'s `send()` is stuck
/// retransmitting the same chunk forever until `abort()` delivers the `AckItem::Abort` sentinel.
#[test]
fn abort_unblocks_a_pending_send() {
    init_logging();
    let fabric: Arc<Fabric<Segment>> = Arc::new(Fabric::new());
    let a_addr = VirtualAddress::new(vip("h1"), Port(10));
    let b_addr = VirtualAddress::new(vip("h2"), Port(20));
    let (conn_a, _conn_b) = connect_pair(&fabric, a_addr, b_addr);

    let sender = thread::spawn({
        let conn_a = conn_a.clone();
        move || conn_a.send(b"stuck")
    });
    thread::sleep(Duration::from_millis(50));
    conn_a.abort();

    sender.join().unwrap();
}

/// `conn_b` never calls `close()`, so `conn_a`'s active-side teardown exhausts its FIN retry
/// budget and blocks in FIN_WAIT_2 (`fin_rx.recv()`) until `abort()` delivers `FinItem::Abort`.
#[test]
fn abort_unblocks_a_pending_close() {
    init_logging();
    let fabric: Arc<Fabric<Segment>> = Arc::new(Fabric::new());
    let a_addr = VirtualAddress::new(vip("h1"), Port(10));
    let b_addr = VirtualAddress::new(vip("h2"), Port(20));
    let (conn_a, _conn_b) = connect_pair(&fabric, a_addr, b_addr);

    let closer = thread::spawn({
        let conn_a = conn_a.clone();
        move || conn_a.close()
    });
    thread::sleep(Duration::from_millis(300));
    conn_a.abort();

    closer.join().unwrap();
}
