//! Local adapter handle.
//!
//! Every session is opened through an explicit [`Adapter`], which names the
//! transport, the session defaults and where events go.

use std::{fmt, sync::Arc};

use smol_str::SmolStr;

use crate::{
   config::SessionConfig,
   error::Result,
   event::EventSender,
   transport::{Transport, l2cap::L2capTransport},
};

#[derive(Clone)]
pub struct Adapter {
   name: SmolStr,
   transport: Arc<dyn Transport>,
   config: SessionConfig,
   events: Option<EventSender>,
}

impl Adapter {
   /// Opens a BlueZ adapter by name, e.g. `hci0`.
   pub async fn open(name: &str, config: SessionConfig) -> Result<Self> {
      let transport = L2capTransport::new(name, config.security).await?;
      Ok(Self::with_transport(name, transport, config))
   }

   pub fn with_transport(name: &str, transport: impl Transport, config: SessionConfig) -> Self {
      Self {
         name: SmolStr::new(name),
         transport: Arc::new(transport),
         config,
         events: None,
      }
   }

   /// Reports events of every session opened through this adapter to `events`.
   #[must_use]
   pub fn with_events(mut self, events: EventSender) -> Self {
      self.events = Some(events);
      self
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   pub const fn config(&self) -> &SessionConfig {
      &self.config
   }

   pub(crate) fn transport(&self) -> &dyn Transport {
      self.transport.as_ref()
   }

   pub(crate) fn events(&self) -> Option<EventSender> {
      self.events.clone()
   }
}

impl fmt::Debug for Adapter {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Adapter")
         .field("name", &self.name)
         .field("config", &self.config)
         .field("events", &self.events.is_some())
         .finish_non_exhaustive()
   }
}
