//! In-process transport.
//!
//! Every link opened through a [`MemoryTransport`] hands its far end to a
//! [`PeerAcceptor`] as a [`MemoryPeer`], which can read what the client sent
//! and inject frames back. Used to run sessions against a simulated
//! peripheral without a radio.

use std::time::Duration;

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use futures::future::BoxFuture;
use log::debug;
use tokio::{sync::mpsc, task::JoinSet, time};

use crate::{
   error::{Error, Result},
   transport::{AddressType, Command, Frame, LINK_QUEUE_DEPTH, Link, Transport},
};

/// How [`MemoryTransport::open`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenBehavior {
   #[default]
   Accept,
   /// Fail immediately as if the peer refused.
   Refuse,
   /// Fail as if the OS denied access to the radio.
   DenyPermission,
   /// Never complete; the open times out.
   Hang,
}

/// Transport whose links end inside the process.
#[derive(Debug)]
pub struct MemoryTransport {
   peers: mpsc::UnboundedSender<MemoryPeer>,
   behavior: AtomicCell<OpenBehavior>,
}

/// Receives the far end of every accepted link.
#[derive(Debug)]
pub struct PeerAcceptor {
   peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl PeerAcceptor {
   pub async fn accept(&mut self) -> Option<MemoryPeer> {
      self.peers.recv().await
   }
}

impl MemoryTransport {
   pub fn new() -> (Self, PeerAcceptor) {
      let (tx, rx) = mpsc::unbounded_channel();
      let transport = Self {
         peers: tx,
         behavior: AtomicCell::new(OpenBehavior::Accept),
      };
      (transport, PeerAcceptor { peers: rx })
   }

   pub fn set_behavior(&self, behavior: OpenBehavior) {
      self.behavior.store(behavior);
   }

   async fn connect(
      &self,
      address: Address,
      address_type: AddressType,
      timeout: Duration,
   ) -> Result<Link> {
      match self.behavior.load() {
         OpenBehavior::Accept => {},
         OpenBehavior::Refuse => {
            return Err(Error::Connection(format!("{address} refused the connection")));
         },
         OpenBehavior::DenyPermission => {
            return Err(Error::Permission("operation not permitted".into()));
         },
         OpenBehavior::Hang => {
            time::sleep(timeout).await;
            return Err(Error::Connection(format!("connection to {address} timed out")));
         },
      }

      let (cmd_tx, cmd_rx) = mpsc::channel(LINK_QUEUE_DEPTH);
      let (in_tx, in_rx) = mpsc::channel(LINK_QUEUE_DEPTH);
      let peer = MemoryPeer {
         address,
         address_type,
         sent: cmd_rx,
         inject: in_tx,
      };
      self
         .peers
         .send(peer)
         .map_err(|_| Error::Connection("no peer is listening".into()))?;

      debug!("Opened in-memory link to {address} ({address_type})");
      Ok(Link::new(address, cmd_tx, in_rx, JoinSet::new()))
   }
}

impl Transport for MemoryTransport {
   fn open(
      &self,
      address: Address,
      address_type: AddressType,
      timeout: Duration,
   ) -> BoxFuture<'_, Result<Link>> {
      Box::pin(self.connect(address, address_type, timeout))
   }
}

/// The peripheral's end of an in-memory link.
#[derive(Debug)]
pub struct MemoryPeer {
   address: Address,
   address_type: AddressType,
   sent: mpsc::Receiver<Command>,
   inject: mpsc::Sender<Result<Frame>>,
}

impl MemoryPeer {
   pub const fn address(&self) -> Address {
      self.address
   }

   pub const fn address_type(&self) -> AddressType {
      self.address_type
   }

   /// Next frame written by the client, or `None` once it closed the link.
   pub async fn recv(&mut self) -> Option<Frame> {
      let Command::Send { data, then } = self.sent.recv().await?;
      let _ = then.send(Ok(()));
      Some(data)
   }

   /// Delivers a frame to the client. Returns `false` if the link is gone.
   pub async fn send(&self, frame: &[u8]) -> bool {
      self.inject.send(Ok(Frame::from_slice(frame))).await.is_ok()
   }

   /// Drops the link from the peripheral side.
   pub async fn disconnect(self) {
      let _ = self.inject.send(Err(Error::LinkClosed)).await;
   }
}
