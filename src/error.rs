//! Error types for the BLE session manager.
//!
//! This module defines every error a session, the transport link, the ATT
//! codec or the daemon can produce. Errors are grouped by how far they
//! propagate: codec errors are per-frame, protocol errors are per-request,
//! and transport errors or timeouts end the whole session.

use bluer::Address;
use thiserror::Error;

use crate::att::{AttErrorCode, FrameError, Opcode};

/// Main error type for the session manager.
#[derive(Error, Debug)]
pub enum Error {
   /// The link could not be established. The caller may retry.
   #[error("Connection failed: {0}")]
   Connection(String),

   /// Opening the link needs privileges the process does not hold.
   #[error("Permission denied: {0}")]
   Permission(String),

   #[error("Malformed frame: {0}")]
   MalformedFrame(#[from] FrameError),

   /// The remote answered with an ATT error response.
   #[error("Protocol error: {code} for {request} on handle 0x{handle:04x}")]
   Protocol {
      request: Opcode,
      handle: u16,
      code: AttErrorCode,
   },

   #[error("Request timeout")]
   Timeout,

   #[error("Request cancelled")]
   Cancelled,

   #[error("Link closed")]
   LinkClosed,

   #[error("Session not connected")]
   NotConnected,

   #[error("Invalid argument: {0}")]
   InvalidArgument(String),

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Adapter not found: {0}")]
   AdapterNotFound(String),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Internal error: {0}")]
   Internal(&'static str),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

impl Error {
   /// Returns the ATT error code if the remote rejected the request.
   pub const fn att_code(&self) -> Option<AttErrorCode> {
      match self {
         Self::Protocol { code, .. } => Some(*code),
         _ => None,
      }
   }
}

/// Convenience type alias for Results with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
