//! Attribute Protocol codec.
//!
//! Pure, stateless encoding of client requests and decoding of server PDUs.
//! Nothing here touches a socket; malformed input is reported through
//! [`FrameError`] and never indexes out of bounds.

use thiserror::Error;

pub mod opcode;
pub mod pdu;
pub mod uuid;

pub use opcode::{AttErrorCode, COMMAND_FLAG, Opcode};
pub use pdu::{DecodedMessage, ErrorResponse, HandleValue, Request, Response, decode};
pub use uuid::AttUuid;

/// Fixed L2CAP channel carrying ATT on an LE link.
pub const ATT_CID: u16 = 0x0004;
/// Minimum ATT_MTU on LE, used until an MTU exchange succeeds.
pub const DEFAULT_MTU: u16 = 23;
/// Largest ATT_MTU BlueZ will negotiate.
pub const MAX_MTU: u16 = 517;

/// Error type for frame decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
   #[error("Empty frame")]
   Empty,

   #[error("Unknown opcode: 0x{0:02x}")]
   UnknownOpcode(u8),

   /// A server PDU where a client PDU was expected, or the reverse.
   #[error("Unexpected {0} PDU in this direction")]
   WrongDirection(Opcode),

   #[error("{opcode} too short: expected at least {expected} bytes, got {actual}")]
   TooShort {
      opcode: Opcode,
      expected: usize,
      actual: usize,
   },

   #[error("{opcode} size mismatch: expected {expected} bytes, got {actual}")]
   SizeMismatch {
      opcode: Opcode,
      expected: usize,
      actual: usize,
   },

   #[error("Invalid UUID length: {0}")]
   InvalidUuidLength(usize),

   #[error("Invalid {opcode} format: {reason}")]
   InvalidFormat {
      opcode: Opcode,
      reason: &'static str,
   },
}
