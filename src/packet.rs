//! Network packet model shared between the framer and the network stack.
//!
//! The framer only needs a small surface: a family, a "already PPP-framed"
//! marker, a bounded payload it can append to byte by byte, and a read cursor
//! for draining the payload while encoding. The stack on top is represented
//! by [`NetInterface`], which allocates receive packets and consumes completed
//! frames.

use bytes::{BufMut, BytesMut};

use crate::Result;

/// Address family of the payload carried by a [`Packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Unspec,
    Ipv4,
    Ipv6,
}

/// A network-layer packet with a bounded payload and a read cursor.
#[derive(Debug, Clone)]
pub struct Packet {
    family: Family,
    ppp_framed: bool,
    data: BytesMut,
    capacity: usize,
    cursor: usize,
}

impl Packet {
    /// Create an empty packet that can hold up to `capacity` payload bytes.
    pub fn new(family: Family, capacity: usize) -> Self {
        Self {
            family,
            ppp_framed: false,
            data: BytesMut::with_capacity(capacity),
            capacity,
            cursor: 0,
        }
    }

    /// Create a packet pre-filled with `payload`. Capacity equals the payload
    /// length.
    pub fn from_payload(family: Family, payload: &[u8]) -> Self {
        let mut data = BytesMut::with_capacity(payload.len());
        data.put_slice(payload);

        Self {
            family,
            ppp_framed: false,
            data,
            capacity: payload.len(),
            cursor: 0,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn set_family(&mut self, family: Family) {
        self.family = family;
    }

    /// Whether the payload already carries the PPP protocol field.
    pub fn is_ppp(&self) -> bool {
        self.ppp_framed
    }

    pub fn set_ppp(&mut self, ppp_framed: bool) {
        self.ppp_framed = ppp_framed;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append one byte. Fails with `NoMemory` when the packet is full.
    pub fn write_u8(&mut self, byte: u8) -> Result<()> {
        if self.data.len() == self.capacity {
            return Err(crate::Error::NoMemory);
        }

        self.data.put_u8(byte);

        Ok(())
    }

    /// Read one byte at the cursor and advance it. Fails with `NoData` when
    /// the cursor has reached the end of the payload.
    pub fn read_u8(&mut self) -> Result<u8> {
        if self.cursor == self.data.len() {
            return Err(crate::Error::NoData);
        }

        let byte = self.data[self.cursor];
        self.cursor += 1;

        Ok(byte)
    }

    /// Payload bytes left between the cursor and the end.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    /// Drop the last `count` payload bytes. Fails with `NoData` when the
    /// payload is shorter than `count`.
    pub fn remove_tail(&mut self, count: usize) -> Result<()> {
        if self.data.len() < count {
            return Err(crate::Error::NoData);
        }

        let keep = self.data.len() - count;
        self.data.truncate(keep);
        self.cursor = self.cursor.min(keep);

        Ok(())
    }
}

/// Receive-side collaborator: the network stack the framer feeds into.
///
/// Allocation may fail under buffer pressure, in which case the frame in
/// flight is dropped; `recv` consumes a completed, unstuffed frame with the
/// FCS already removed.
pub trait NetInterface: Send + Sync {
    fn alloc_rx_packet(&self) -> Option<Packet>;
    fn recv(&self, packet: Packet);
}
