//! PPP HDLC-async framer bridging a [`Pipe`] and a network interface.
//!
//! Receive: bytes drained from the pipe run through a six-state decoder that
//! syncs on the `7E FF 7D 23` prefix, unstuffs the payload and hands each
//! completed frame (FCS stripped, left for the PPP layer above to verify) to
//! the [`NetInterface`]. Transmit: packets queue into a bounded buffer, a
//! fifteen-state encoder wraps them byte by byte into a transmit ring which
//! the send work pumps into the pipe.

pub mod frame;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::packet::{Family, NetInterface, Packet};
use crate::pipe::{Pipe, PipeEvent};
use crate::sched::{Work, WorkQueue};
use crate::Result;

use frame::{Encoder, ReceiveState, TransmitState, ADDRESS, CONTROL, ESCAPE, FLAG, FRAME_TAIL_SIZE};

/// Configuration consumed by [`Ppp::new`].
#[derive(Clone)]
pub struct PppConfig {
    /// Size of the receive scratch buffer and the transmit ring.
    pub buf_size: usize,
    /// Bound on packets waiting to be encoded.
    pub tx_queue_depth: usize,
    /// Backoff before retrying a transmit the pipe would not accept.
    pub process_delay: Duration,
}

impl Default for PppConfig {
    fn default() -> Self {
        Self {
            buf_size: 256,
            tx_queue_depth: 8,
            process_delay: Duration::from_millis(10),
        }
    }
}

struct PppInner {
    pipe: Option<Pipe>,
    iface: Arc<dyn NetInterface>,

    receive_buf: Vec<u8>,
    receive_state: ReceiveState,
    rx_pkt: Option<Packet>,

    encoder: Encoder,
    tx_pkt: Option<Packet>,
    ring: VecDeque<u8>,
    buf_size: usize,

    process_delay: Duration,
}

impl PppInner {
    fn process_received_byte(&mut self, byte: u8) {
        match self.receive_state {
            ReceiveState::HdrSof => {
                if byte == FLAG {
                    self.receive_state = ReceiveState::HdrFf;
                }
            }

            ReceiveState::HdrFf => {
                if byte == FLAG {
                    // Back-to-back frames share flags
                } else if byte == ADDRESS {
                    self.receive_state = ReceiveState::Hdr7d;
                } else {
                    self.receive_state = ReceiveState::HdrSof;
                }
            }

            ReceiveState::Hdr7d => {
                if byte == ESCAPE {
                    self.receive_state = ReceiveState::Hdr23;
                } else {
                    self.receive_state = ReceiveState::HdrSof;
                }
            }

            ReceiveState::Hdr23 => {
                if byte == (CONTROL ^ 0x20) {
                    match self.iface.alloc_rx_packet() {
                        Some(mut packet) => {
                            packet.reset_cursor();

                            debug!("receiving ppp frame");

                            self.rx_pkt = Some(packet);
                            self.receive_state = ReceiveState::Writing;
                        }
                        None => {
                            warn!("dropped frame, no packet available");

                            self.receive_state = ReceiveState::HdrSof;
                        }
                    }
                } else {
                    self.receive_state = ReceiveState::HdrSof;
                }
            }

            ReceiveState::Writing => {
                if byte == FLAG {
                    if let Some(mut packet) = self.rx_pkt.take() {
                        if packet.remove_tail(FRAME_TAIL_SIZE).is_err() {
                            warn!("dropped runt ppp frame");
                        } else {
                            packet.reset_cursor();
                            packet.set_ppp(true);

                            debug!(len = packet.len(), "received ppp frame");

                            self.iface.recv(packet);
                        }
                    }

                    self.receive_state = ReceiveState::HdrSof;

                    return;
                }

                if byte == ESCAPE {
                    self.receive_state = ReceiveState::Unescaping;

                    return;
                }

                self.write_rx_byte(byte);
            }

            ReceiveState::Unescaping => {
                if self.write_rx_byte(byte ^ 0x20) {
                    self.receive_state = ReceiveState::Writing;
                }
            }
        }
    }

    /// Append a decoded byte to the packet under construction; on failure the
    /// frame is dropped and the decoder re-syncs.
    fn write_rx_byte(&mut self, byte: u8) -> bool {
        let Some(packet) = self.rx_pkt.as_mut() else {
            self.receive_state = ReceiveState::HdrSof;

            return false;
        };

        if packet.write_u8(byte).is_err() {
            warn!("dropped ppp frame, packet full");

            self.rx_pkt = None;
            self.receive_state = ReceiveState::HdrSof;

            return false;
        }

        true
    }
}

/// PPP framer instance.
pub struct Ppp {
    inner: Arc<Mutex<PppInner>>,
    tx_queue: Arc<Mutex<VecDeque<Packet>>>,
    tx_queue_depth: usize,
    attached: Arc<AtomicBool>,
    send_work: Work,
    process_work: Work,
}

impl Ppp {
    /// Validate the configuration and register the framer's work units.
    pub fn new(
        config: PppConfig,
        queue: &WorkQueue,
        iface: Arc<dyn NetInterface>,
    ) -> Result<Ppp> {
        if config.buf_size == 0 {
            return Err(crate::Error::InvalidArgument("buf_size is zero"));
        }

        if config.tx_queue_depth == 0 {
            return Err(crate::Error::InvalidArgument("tx_queue_depth is zero"));
        }

        let inner = Arc::new(Mutex::new(PppInner {
            pipe: None,
            iface,
            receive_buf: vec![0; config.buf_size],
            receive_state: ReceiveState::HdrSof,
            rx_pkt: None,
            encoder: Encoder::new(),
            tx_pkt: None,
            ring: VecDeque::with_capacity(config.buf_size),
            buf_size: config.buf_size,
            process_delay: config.process_delay,
        }));

        let tx_queue: Arc<Mutex<VecDeque<Packet>>> = Arc::new(Mutex::new(VecDeque::new()));

        // Forward references resolved after registration
        let send_slot: Arc<Mutex<Option<Work>>> = Arc::new(Mutex::new(None));
        let process_slot: Arc<Mutex<Option<Work>>> = Arc::new(Mutex::new(None));

        let send_work = {
            let inner = inner.clone();
            let tx_queue = tx_queue.clone();
            let send_slot = send_slot.clone();

            queue.register(move || {
                let mut guard = inner.lock().unwrap();
                let ppp: &mut PppInner = &mut guard;

                let Some(pipe) = ppp.pipe.clone() else {
                    return;
                };

                if ppp.tx_pkt.is_none() {
                    ppp.tx_pkt = tx_queue.lock().unwrap().pop_front();
                }

                if ppp.tx_pkt.is_some() {
                    if ppp.encoder.state == TransmitState::Idle {
                        ppp.encoder.state = TransmitState::Sof;
                    }

                    // Wrap bytes until the ring is full or the frame is done
                    while ppp.ring.len() < ppp.buf_size {
                        let Some(packet) = ppp.tx_pkt.as_mut() else {
                            break;
                        };

                        let byte = ppp.encoder.next_byte(packet);

                        ppp.ring.push_back(byte);

                        if ppp.encoder.state == TransmitState::Idle {
                            debug!("ppp frame encoded");

                            ppp.tx_pkt = tx_queue.lock().unwrap().pop_front();

                            break;
                        }
                    }
                }

                let (head, _) = ppp.ring.as_slices();

                if head.is_empty() {
                    return;
                }

                let sent = match pipe.transmit(head) {
                    Ok(sent) => sent,
                    Err(_) => 0,
                };

                ppp.ring.drain(..sent);

                let send = send_slot.lock().unwrap().clone();
                let Some(send) = send else {
                    return;
                };

                if sent == 0 {
                    // The pipe would not take anything; back off instead of
                    // spinning
                    send.schedule_after(ppp.process_delay);

                    return;
                }

                if !ppp.ring.is_empty() || ppp.tx_pkt.is_some() {
                    send.schedule_now();
                }
            })
        };

        let process_work = {
            let inner = inner.clone();
            let process_slot = process_slot.clone();

            queue.register(move || {
                let mut guard = inner.lock().unwrap();
                let ppp: &mut PppInner = &mut guard;

                let Some(pipe) = ppp.pipe.clone() else {
                    return;
                };

                let received = match pipe.receive(&mut ppp.receive_buf) {
                    Ok(received) => received,
                    Err(_) => return,
                };

                if received == 0 {
                    return;
                }

                for index in 0..received {
                    let byte = ppp.receive_buf[index];
                    ppp.process_received_byte(byte);
                }

                if let Some(process) = process_slot.lock().unwrap().clone() {
                    process.schedule_now();
                }
            })
        };

        *send_slot.lock().unwrap() = Some(send_work.clone());
        *process_slot.lock().unwrap() = Some(process_work.clone());

        Ok(Ppp {
            inner,
            tx_queue,
            tx_queue_depth: config.tx_queue_depth,
            attached: Arc::new(AtomicBool::new(false)),
            send_work,
            process_work,
        })
    }

    /// Bind a pipe and take over its event callback. Idempotent; only the
    /// first call attaches.
    pub fn attach(&self, pipe: &Pipe) {
        if self.attached.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.lock().unwrap().pipe = Some(pipe.clone());

        let process = self.process_work.clone();

        pipe.attach(move |event| {
            if event == PipeEvent::ReceiveReady {
                process.schedule_now();
            }
        });
    }

    /// Queue a packet for framing and transmission.
    ///
    /// The packet must be IPv4, IPv6 or already PPP-framed, and long enough
    /// to carry at least a protocol field's worth of payload.
    pub fn send(&self, packet: Packet) -> Result<()> {
        if !self.attached.load(Ordering::SeqCst) {
            return Err(crate::Error::PermissionDenied);
        }

        if !packet.is_ppp()
            && packet.family() != Family::Ipv4
            && packet.family() != Family::Ipv6
        {
            return Err(crate::Error::ProtocolNotSupported);
        }

        if packet.is_empty() || (packet.is_ppp() && packet.len() < 2) {
            return Err(crate::Error::NoData);
        }

        {
            let mut tx_queue = self.tx_queue.lock().unwrap();

            if tx_queue.len() == self.tx_queue_depth {
                warn!("tx packet queue overrun");

                return Err(crate::Error::NoMemory);
            }

            tx_queue.push_back(packet);
        }

        self.send_work.schedule_now();

        Ok(())
    }

    /// Detach from the pipe, synchronously cancel the framer's work, drop any
    /// in-flight frames and drain the transmit queue. The instance can be
    /// attached again afterwards.
    pub async fn release(&self) {
        if !self.attached.swap(false, Ordering::SeqCst) {
            return;
        }

        {
            let ppp = self.inner.lock().unwrap();

            if let Some(pipe) = &ppp.pipe {
                pipe.release();
            }
        }

        self.send_work.cancel_sync().await;
        self.process_work.cancel_sync().await;

        let mut ppp = self.inner.lock().unwrap();

        ppp.pipe = None;
        ppp.receive_state = ReceiveState::HdrSof;
        ppp.rx_pkt = None;
        ppp.encoder.reset();
        ppp.tx_pkt = None;
        ppp.ring.clear();

        self.tx_queue.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests;
