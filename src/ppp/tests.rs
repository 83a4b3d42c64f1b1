use super::*;
use crate::backend::{loopback, LoopbackHandle};
use crate::sched::WorkQueue;
use super::frame::Protocol;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Network interface that records every delivered frame.
struct MockIface {
    received: Mutex<Vec<Packet>>,
    packet_capacity: usize,
    fail_alloc: AtomicBool,
}

impl MockIface {
    fn new(packet_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            packet_capacity,
            fail_alloc: AtomicBool::new(false),
        })
    }

    fn received_payloads(&self) -> Vec<Vec<u8>> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|packet| packet.as_slice().to_vec())
            .collect()
    }
}

impl NetInterface for MockIface {
    fn alloc_rx_packet(&self) -> Option<Packet> {
        if self.fail_alloc.load(Ordering::SeqCst) {
            return None;
        }

        Some(Packet::new(Family::Unspec, self.packet_capacity))
    }

    fn recv(&self, packet: Packet) {
        self.received.lock().unwrap().push(packet);
    }
}

struct Harness {
    queue: Arc<WorkQueue>,
    ppp: Ppp,
    iface: Arc<MockIface>,
    handle: LoopbackHandle,
}

fn harness(config: PppConfig) -> Harness {
    let queue = WorkQueue::new();
    let iface = MockIface::new(1500);
    let ppp = Ppp::new(config, &queue, iface.clone()).unwrap();

    let (pipe, handle) = loopback();
    pipe.open_async().unwrap();
    handle.notify_opened();

    ppp.attach(&pipe);

    Harness {
        queue,
        ppp,
        iface,
        handle,
    }
}

#[tokio::test(start_paused = true)]
async fn test_ipv4_round_trip() {
    let sender = harness(PppConfig::default());

    let payload = [0x45, 0x00, 0x00, 0x1C, 0x11, 0x22, 0x33, 0x44];
    sender
        .ppp
        .send(Packet::from_payload(Family::Ipv4, &payload))
        .unwrap();
    settle().await;

    let wire = sender.handle.transmitted();
    assert_eq!(&wire[..4], &[0x7E, 0xFF, 0x7D, 0x23]);
    assert_eq!(wire[wire.len() - 1], 0x7E);

    // Feed the wire bytes into a second instance's receive side
    let receiver = harness(PppConfig::default());
    receiver.handle.inject(&wire);
    settle().await;

    let frames = receiver.iface.received_payloads();
    assert_eq!(frames.len(), 1);

    // The delivered frame keeps the protocol field and sheds the FCS
    assert_eq!(&frames[0][..2], &[0x00, 0x21]);
    assert_eq!(&frames[0][2..], &payload);
    assert_eq!(
        Protocol::try_from(u16::from_be_bytes([frames[0][0], frames[0][1]])).unwrap(),
        Protocol::Ipv4
    );
    assert!(receiver.iface.received.lock().unwrap()[0].is_ppp());

    sender.queue.shutdown().await;
    receiver.queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ipv6_protocol_field() {
    let h = harness(PppConfig::default());

    h.ppp
        .send(Packet::from_payload(Family::Ipv6, &[0x60, 0x00, 0x00, 0x00]))
        .unwrap();
    settle().await;

    let wire = h.handle.transmitted();
    assert_eq!(&wire[4..6], &[0x00, 0x57]);

    h.queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_flag_byte_in_payload_is_escaped() {
    let h = harness(PppConfig::default());

    h.ppp
        .send(Packet::from_payload(Family::Ipv4, &[0x45, 0x7E, 0x99]))
        .unwrap();
    settle().await;

    let wire = h.handle.transmitted();
    let interior = &wire[1..wire.len() - 1];

    assert!(!interior.contains(&0x7E));
    assert!(interior.windows(2).any(|pair| pair == [0x7D, 0x5E]));

    h.queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_interior_never_carries_unescaped_control_bytes() {
    let h = harness(PppConfig::default());

    // A payload that needs stuffing everywhere
    let payload: Vec<u8> = (0x00..0x20).chain([0x7D, 0x7E, 0x45]).collect();
    h.ppp
        .send(Packet::from_payload(Family::Ipv4, &payload))
        .unwrap();
    settle().await;

    let wire = h.handle.transmitted();
    let interior = &wire[1..wire.len() - 1];

    let mut index = 0;
    while index < interior.len() {
        if interior[index] == 0x7D {
            index += 2;
            continue;
        }

        assert!(interior[index] >= 0x20);
        assert_ne!(interior[index], 0x7E);
        index += 1;
    }

    // And the frame still decodes to the original payload
    let receiver = harness(PppConfig::default());
    receiver.handle.inject(&wire);
    settle().await;

    let frames = receiver.iface.received_payloads();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][2..], &payload[..]);

    h.queue.shutdown().await;
    receiver.queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ppp_framed_packet_sent_verbatim_after_header() {
    let h = harness(PppConfig::default());

    // An LCP-style payload that already starts with its protocol field
    let mut packet = Packet::from_payload(Family::Unspec, &[0xC0, 0x21, 0x09, 0x00]);
    packet.set_ppp(true);

    h.ppp.send(packet).unwrap();
    settle().await;

    let wire = h.handle.transmitted();
    assert_eq!(&wire[..6], &[0x7E, 0xFF, 0x7D, 0x23, 0xC0, 0x21]);

    h.queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_validation() {
    let queue = WorkQueue::new();
    let iface = MockIface::new(1500);
    let ppp = Ppp::new(PppConfig::default(), &queue, iface).unwrap();

    // Detached
    assert!(matches!(
        ppp.send(Packet::from_payload(Family::Ipv4, &[0x45])),
        Err(crate::Error::PermissionDenied)
    ));

    let (pipe, handle) = loopback();
    pipe.open_async().unwrap();
    handle.notify_opened();
    ppp.attach(&pipe);

    // Unsupported family
    assert!(matches!(
        ppp.send(Packet::from_payload(Family::Unspec, &[0x45])),
        Err(crate::Error::ProtocolNotSupported)
    ));

    // Too short
    assert!(matches!(
        ppp.send(Packet::from_payload(Family::Ipv4, &[])),
        Err(crate::Error::NoData)
    ));

    let mut short_ppp = Packet::from_payload(Family::Unspec, &[0xC0]);
    short_ppp.set_ppp(true);
    assert!(matches!(ppp.send(short_ppp), Err(crate::Error::NoData)));

    queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_tx_queue_overrun_reports_no_memory() {
    let config = PppConfig {
        tx_queue_depth: 2,
        ..PppConfig::default()
    };

    let h = harness(config);

    // No awaits in between, so the send work cannot drain the queue yet
    h.ppp
        .send(Packet::from_payload(Family::Ipv4, &[0x45, 0x01]))
        .unwrap();
    h.ppp
        .send(Packet::from_payload(Family::Ipv4, &[0x45, 0x02]))
        .unwrap();

    assert!(matches!(
        h.ppp.send(Packet::from_payload(Family::Ipv4, &[0x45, 0x03])),
        Err(crate::Error::NoMemory)
    ));

    // Once drained, all accepted frames went out whole and in order
    settle().await;

    let wire = h.handle.transmitted();
    let frames: Vec<&[u8]> = wire
        .split(|&byte| byte == 0x7E)
        .filter(|chunk| !chunk.is_empty())
        .collect();

    assert_eq!(frames.len(), 2);

    h.queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_alloc_failure_drops_frame_and_resyncs() {
    let h = harness(PppConfig::default());

    let sender = harness(PppConfig::default());
    sender
        .ppp
        .send(Packet::from_payload(Family::Ipv4, &[0x45, 0xAA]))
        .unwrap();
    settle().await;
    let wire = sender.handle.transmitted();

    h.iface.fail_alloc.store(true, Ordering::SeqCst);
    h.handle.inject(&wire);
    settle().await;

    assert!(h.iface.received_payloads().is_empty());

    // The decoder recovers on the next frame
    h.iface.fail_alloc.store(false, Ordering::SeqCst);
    h.handle.inject(&wire);
    settle().await;

    assert_eq!(h.iface.received_payloads().len(), 1);

    h.queue.shutdown().await;
    sender.queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_noise_between_frames_is_ignored() {
    let h = harness(PppConfig::default());

    let sender = harness(PppConfig::default());
    sender
        .ppp
        .send(Packet::from_payload(Family::Ipv4, &[0x45, 0xBB, 0xCC]))
        .unwrap();
    settle().await;
    let wire = sender.handle.transmitted();

    // Garbage, repeated flags, then a valid frame
    h.handle.inject(b"ATNOISE");
    h.handle.inject(&[0x7E, 0x7E, 0x7E]);
    h.handle.inject(&wire);
    settle().await;

    let frames = h.iface.received_payloads();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][2..], &[0x45, 0xBB, 0xCC]);

    h.queue.shutdown().await;
    sender.queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_partial_transmit_pumps_whole_frame() {
    let h = harness(PppConfig::default());

    h.handle.set_transmit_limit(3);

    let payload = [0x45, 0x00, 0x10, 0x20, 0x30, 0x40, 0x50, 0x60];
    h.ppp
        .send(Packet::from_payload(Family::Ipv4, &payload))
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;

    let wire = h.handle.transmitted();
    assert_eq!(wire[0], 0x7E);
    assert_eq!(wire[wire.len() - 1], 0x7E);

    let receiver = harness(PppConfig::default());
    receiver.handle.inject(&wire);
    settle().await;

    assert_eq!(&receiver.iface.received_payloads()[0][2..], &payload);

    h.queue.shutdown().await;
    receiver.queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_release_drops_queued_packets_and_detaches() {
    let h = harness(PppConfig::default());

    h.ppp
        .send(Packet::from_payload(Family::Ipv4, &[0x45, 0x01]))
        .unwrap();

    h.ppp.release().await;

    assert!(matches!(
        h.ppp.send(Packet::from_payload(Family::Ipv4, &[0x45, 0x02])),
        Err(crate::Error::PermissionDenied)
    ));

    settle().await;

    h.queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_runt_frame_is_dropped() {
    let h = harness(PppConfig::default());

    // Header then immediate closing flag: nothing to strip an FCS from
    h.handle.inject(&[0x7E, 0xFF, 0x7D, 0x23, 0x7E]);
    settle().await;

    assert!(h.iface.received_payloads().is_empty());

    h.queue.shutdown().await;
}
