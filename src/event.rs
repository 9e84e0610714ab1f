//! Session events.
//!
//! Sessions report lifecycle changes through an [`EventBus`] attached to the
//! [`Adapter`](crate::adapter::Adapter). The daemon turns them into D-Bus
//! signals; library users may install their own bus or none at all.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

use crate::session::{CloseReason, SessionState};

/// Events emitted by sessions.
#[derive(Debug, Clone)]
pub enum SessionEvent {
   Connected,
   Disconnected(CloseReason),
   StateChanged(SessionState),
   Notification { handle: u16, value: Vec<u8> },
   SessionError(SmolStr),
}

/// Receives events from every session on an adapter.
pub trait EventBus: Send + Sync {
   /// Must not block; it is called from session workers.
   fn emit(&self, address: Address, event: SessionEvent);
}

pub type EventSender = Arc<dyn EventBus>;
