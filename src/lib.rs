pub mod backend;
pub mod chat;
pub mod packet;
pub mod pipe;
pub mod ppp;
pub mod sched;


// Re-export the core handle types for direct access
pub use chat::{Chat, ChatConfig, ChatScript, Match, ScriptResult, ScriptStep};
pub use packet::{Family, NetInterface, Packet};
pub use pipe::{Pipe, PipeEvent, Transport};
pub use ppp::{Ppp, PppConfig};
pub use sched::{Work, WorkQueue};

use std::io;
use thiserror::Error;

/// Error returned by the fallible operations of every layer.
///
/// The transports underneath the pipe surface their faults as `io::Error`;
/// everything the crate itself detects is a dedicated variant so callers can
/// match on the condition rather than parse a message.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation on a closed pipe, or an engine used before `attach`
    #[error("operation not permitted in current state")]
    PermissionDenied,

    /// Malformed script or configuration
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A script is already running on this chat instance
    #[error("busy")]
    Busy,

    /// Transmit packet queue overrun
    #[error("out of queue space")]
    NoMemory,

    /// Pipe open or close did not complete within the wait ceiling
    #[error("state transition did not complete in time")]
    Retry,

    /// Packet family is neither IPv4 nor IPv6 and the packet is not PPP-framed
    #[error("protocol not supported")]
    ProtocolNotSupported,

    /// Packet too short to frame
    #[error("no data")]
    NoData,

    /// Fault surfaced by the byte transport
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

/// A specialized `Result` type for modem-link operations.
pub type Result<T> = std::result::Result<T, Error>;
