//! Byte-level HDLC async framing: FCS-16, protocol field and the transmit
//! encoder state machine.
//!
//! PPP over asynchronous serial (RFC 1662) frames a payload as
//! `7E FF 7D 23 | protocol | payload | fcs-lo fcs-hi | 7E`, where the control
//! field `0x03` and every payload byte in `{0x7E, 0x7D}` or below `0x20` is
//! stuffed as `7D` followed by the byte XOR `0x20`. The FCS is CRC-16-CCITT
//! over the unstuffed `FF 03 | protocol | payload`, seed `0xFFFF`, final XOR
//! `0xFFFF`, transmitted little-endian.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::warn;

use crate::packet::{Family, Packet};

pub const FLAG: u8 = 0x7E;
pub const ESCAPE: u8 = 0x7D;
pub const ADDRESS: u8 = 0xFF;
pub const CONTROL: u8 = 0x03;

/// Bytes stripped off the end of a received frame (the FCS).
pub const FRAME_TAIL_SIZE: usize = 2;

/// PPP protocol field values for the families the framer encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Protocol {
    Ipv4 = 0x0021,
    Ipv6 = 0x0057,
}

/// Protocol field for a packet about to be framed. Returns 0 for an
/// unsupported family; `send` validation rejects those before encoding.
pub fn protocol_for(packet: &Packet) -> u16 {
    match packet.family() {
        Family::Ipv4 => Protocol::Ipv4.into(),
        Family::Ipv6 => Protocol::Ipv6.into(),
        Family::Unspec => {
            warn!("unsupported protocol family");
            0
        }
    }
}

/// Whether a byte must be transmitted as `ESCAPE, byte ^ 0x20`.
pub fn needs_escape(byte: u8) -> bool {
    byte == FLAG || byte == ESCAPE || byte < 0x20
}

pub fn fcs16_init(byte: u8) -> u16 {
    fcs16_update(0xFFFF, byte)
}

pub fn fcs16_update(fcs: u16, byte: u8) -> u16 {
    let mut fcs = fcs ^ byte as u16;

    for _ in 0..8 {
        fcs = if fcs & 1 != 0 { (fcs >> 1) ^ 0x8408 } else { fcs >> 1 };
    }

    fcs
}

pub fn fcs16_final(fcs: u16) -> u16 {
    fcs ^ 0xFFFF
}

/// Receive decoder states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// Searching for the start-of-frame flag
    HdrSof,
    /// Expecting the address byte, tolerating repeated flags
    HdrFf,
    /// Expecting the escape that starts the stuffed control field
    Hdr7d,
    /// Expecting the stuffed control byte
    Hdr23,
    /// Writing payload bytes into the packet under construction
    Writing,
    /// Unescaping the next byte before writing it
    Unescaping,
}

/// Transmit encoder states. The `Escaping*` shadows hold the staged
/// `byte ^ 0x20` emitted on the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitState {
    Idle,
    Sof,
    HdrFf,
    Hdr7d,
    Hdr23,
    ProtocolHigh,
    EscapingProtocolHigh,
    ProtocolLow,
    EscapingProtocolLow,
    Data,
    EscapingData,
    FcsLow,
    EscapingFcsLow,
    FcsHigh,
    EscapingFcsHigh,
    Eof,
}

/// Wraps one packet into wire bytes, one byte per call.
///
/// Drive by setting the state to [`TransmitState::Sof`] and calling
/// [`Encoder::next_byte`] until the state returns to [`TransmitState::Idle`];
/// the byte produced by the `Idle`-transitioning call is the closing flag.
#[derive(Debug)]
pub struct Encoder {
    pub state: TransmitState,
    protocol: u16,
    fcs: u16,
    escaped: u8,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            state: TransmitState::Idle,
            protocol: 0,
            fcs: 0,
            escaped: 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = TransmitState::Idle;
    }

    /// Stage `byte` for escaped emission: emit the escape marker now, the
    /// staged value on the next call.
    fn escape_into(&mut self, byte: u8, next: TransmitState) -> u8 {
        self.escaped = byte ^ 0x20;
        self.state = next;

        ESCAPE
    }

    pub fn next_byte(&mut self, packet: &mut Packet) -> u8 {
        match self.state {
            TransmitState::Idle => {
                warn!("invalid transmit state");

                0
            }

            // Writing header
            TransmitState::Sof => {
                self.state = TransmitState::HdrFf;

                FLAG
            }

            TransmitState::HdrFf => {
                packet.reset_cursor();

                self.fcs = fcs16_init(ADDRESS);
                self.state = TransmitState::Hdr7d;

                ADDRESS
            }

            TransmitState::Hdr7d => {
                self.fcs = fcs16_update(self.fcs, CONTROL);
                self.state = TransmitState::Hdr23;

                ESCAPE
            }

            TransmitState::Hdr23 => {
                if packet.is_ppp() {
                    self.state = TransmitState::Data;
                } else {
                    self.protocol = protocol_for(packet);
                    self.state = TransmitState::ProtocolHigh;
                }

                CONTROL ^ 0x20
            }

            // Writing protocol
            TransmitState::ProtocolHigh => {
                let byte = (self.protocol >> 8) as u8;

                self.fcs = fcs16_update(self.fcs, byte);

                if needs_escape(byte) {
                    return self.escape_into(byte, TransmitState::EscapingProtocolHigh);
                }

                self.state = TransmitState::ProtocolLow;

                byte
            }

            TransmitState::EscapingProtocolHigh => {
                self.state = TransmitState::ProtocolLow;

                self.escaped
            }

            TransmitState::ProtocolLow => {
                let byte = (self.protocol & 0xFF) as u8;

                self.fcs = fcs16_update(self.fcs, byte);

                if needs_escape(byte) {
                    return self.escape_into(byte, TransmitState::EscapingProtocolLow);
                }

                self.state = TransmitState::Data;

                byte
            }

            TransmitState::EscapingProtocolLow => {
                self.state = TransmitState::Data;

                self.escaped
            }

            // Writing data
            TransmitState::Data => {
                let byte = packet.read_u8().unwrap_or(0);

                self.fcs = fcs16_update(self.fcs, byte);

                if needs_escape(byte) {
                    return self.escape_into(byte, TransmitState::EscapingData);
                }

                if packet.remaining() == 0 {
                    self.state = TransmitState::FcsLow;
                }

                byte
            }

            TransmitState::EscapingData => {
                self.state = if packet.remaining() == 0 {
                    TransmitState::FcsLow
                } else {
                    TransmitState::Data
                };

                self.escaped
            }

            // Writing FCS
            TransmitState::FcsLow => {
                self.fcs = fcs16_final(self.fcs);

                let byte = (self.fcs & 0xFF) as u8;

                if needs_escape(byte) {
                    return self.escape_into(byte, TransmitState::EscapingFcsLow);
                }

                self.state = TransmitState::FcsHigh;

                byte
            }

            TransmitState::EscapingFcsLow => {
                self.state = TransmitState::FcsHigh;

                self.escaped
            }

            TransmitState::FcsHigh => {
                let byte = (self.fcs >> 8) as u8;

                if needs_escape(byte) {
                    return self.escape_into(byte, TransmitState::EscapingFcsHigh);
                }

                self.state = TransmitState::Eof;

                byte
            }

            TransmitState::EscapingFcsHigh => {
                self.state = TransmitState::Eof;

                self.escaped
            }

            // Writing end of frame
            TransmitState::Eof => {
                self.state = TransmitState::Idle;

                FLAG
            }
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}
