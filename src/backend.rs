//! In-memory transport backend.
//!
//! Real deployments sit a UART (or CMUX channel) under the pipe; this crate
//! carries one backend that needs no hardware: a loopback with a bounded
//! receive FIFO and a transmit sink, driven from test or application code
//! through a control handle. The handle side plays the role of the wire:
//! it injects the bytes the far end sent and collects the bytes the local
//! side transmitted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::pipe::{Pipe, Transport};
use crate::Result;

const DEFAULT_FIFO_CAPACITY: usize = 4096;

struct LoopbackState {
    rx: Mutex<VecDeque<u8>>,
    tx: Mutex<VecDeque<u8>>,
    /// Per-call cap on bytes the transport accepts, for exercising partial
    /// transmits. `usize::MAX` means unlimited.
    transmit_limit: Mutex<usize>,
    capacity: usize,
}

struct LoopbackTransport {
    state: Arc<LoopbackState>,
}

impl Transport for LoopbackTransport {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn transmit(&mut self, buf: &[u8]) -> Result<usize> {
        let limit = *self.state.transmit_limit.lock().unwrap();
        let mut tx = self.state.tx.lock().unwrap();

        let room = self.state.capacity - tx.len().min(self.state.capacity);
        let accept = buf.len().min(limit).min(room);

        tx.extend(&buf[..accept]);

        Ok(accept)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut rx = self.state.rx.lock().unwrap();

        let count = rx.len().min(buf.len());

        for slot in buf[..count].iter_mut() {
            *slot = rx.pop_front().unwrap_or(0);
        }

        Ok(count)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Control handle for a [`loopback`] pipe: the far end of the wire.
#[derive(Clone)]
pub struct LoopbackHandle {
    state: Arc<LoopbackState>,
    pipe: Pipe,
}

impl LoopbackHandle {
    /// Complete the open handshake, as a real backend does when the link
    /// comes up.
    pub fn notify_opened(&self) {
        self.pipe.notify_opened();
    }

    /// Take the link down.
    pub fn notify_closed(&self) {
        self.pipe.notify_closed();
    }

    /// Feed bytes into the receive FIFO and signal receive-ready.
    pub fn inject(&self, bytes: &[u8]) {
        self.state.rx.lock().unwrap().extend(bytes);
        self.pipe.notify_receive_ready();
    }

    /// Drain and return everything transmitted so far.
    pub fn transmitted(&self) -> Vec<u8> {
        self.state.tx.lock().unwrap().drain(..).collect()
    }

    /// Number of bytes sitting in the transmit sink.
    pub fn transmitted_len(&self) -> usize {
        self.state.tx.lock().unwrap().len()
    }

    /// Cap the bytes accepted per transmit call, to exercise the resumption
    /// paths of the engines above.
    pub fn set_transmit_limit(&self, limit: usize) {
        *self.state.transmit_limit.lock().unwrap() = limit;
    }
}

/// Create a loopback pipe plus its control handle.
pub fn loopback() -> (Pipe, LoopbackHandle) {
    loopback_with_capacity(DEFAULT_FIFO_CAPACITY)
}

/// Create a loopback pipe with a bounded transmit sink.
pub fn loopback_with_capacity(capacity: usize) -> (Pipe, LoopbackHandle) {
    let state = Arc::new(LoopbackState {
        rx: Mutex::new(VecDeque::new()),
        tx: Mutex::new(VecDeque::new()),
        transmit_limit: Mutex::new(usize::MAX),
        capacity,
    });

    let pipe = Pipe::new(Box::new(LoopbackTransport {
        state: state.clone(),
    }));

    let handle = LoopbackHandle {
        state,
        pipe: pipe.clone(),
    };

    (pipe, handle)
}
