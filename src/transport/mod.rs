//! Transport links to a BLE peripheral.
//!
//! A [`Transport`] opens a [`Link`], a bidirectional channel of ATT frames
//! to one peripheral. Each platform gets its own implementation; the link
//! itself is platform independent and is backed by two bounded queues that
//! the implementation pumps.

use std::{fmt, sync::Arc, time::Duration};

use bluer::Address;
use futures::{Stream, future::BoxFuture, stream};
use log::debug;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::error::{Error, Result};

pub mod l2cap;
pub mod memory;

/// One ATT PDU. Most fit the inline buffer at the default MTU.
pub type Frame = SmallVec<[u8; 32]>;

/// Queue depth in each direction.
pub(crate) const LINK_QUEUE_DEPTH: usize = 128;
/// Timeout for a single write to reach the socket.
const WRITE_TIMEOUT: Duration = Duration::from_secs(25);

/// LE address type of a peripheral.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AddressType {
   #[default]
   Public,
   Random,
}

impl From<AddressType> for bluer::AddressType {
   fn from(value: AddressType) -> Self {
      match value {
         AddressType::Public => Self::LePublic,
         AddressType::Random => Self::LeRandom,
      }
   }
}

/// Link security requested before the first ATT exchange.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SecurityLevel {
   #[default]
   Low,
   Medium,
   High,
}

/// Opens links to peripherals.
pub trait Transport: Send + Sync + 'static {
   /// Establishes a link, failing with [`Error::Connection`] on refusal or
   /// timeout and [`Error::Permission`] when the OS denies access.
   fn open(
      &self,
      address: Address,
      address_type: AddressType,
      timeout: Duration,
   ) -> BoxFuture<'_, Result<Link>>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
   fn open(
      &self,
      address: Address,
      address_type: AddressType,
      timeout: Duration,
   ) -> BoxFuture<'_, Result<Link>> {
      (**self).open(address, address_type, timeout)
   }
}

pub(crate) enum Command {
   Send {
      data: Frame,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Sender half of a link.
#[derive(Debug, Clone)]
pub struct LinkSender {
   tx: mpsc::Sender<Command>,
}

impl LinkSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(Error::LinkClosed);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Frame::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| Error::LinkClosed)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| Error::Timeout)?
         .map_err(|_| Error::LinkClosed)?
   }
}

impl fmt::Debug for Command {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Send { data, .. } => write!(f, "Send({})", hex::encode(data)),
      }
   }
}

/// Receiver half of a link.
///
/// Frames arrive in receipt order. Once the link is gone every further call
/// returns [`Error::LinkClosed`].
#[derive(Debug)]
pub struct LinkReceiver {
   rx: mpsc::Receiver<Result<Frame>>,
   done: bool,
}

impl LinkReceiver {
   pub async fn recv(&mut self) -> Result<Frame> {
      if self.done {
         return Err(Error::LinkClosed);
      }
      match self.rx.recv().await {
         Some(Ok(frame)) => Ok(frame),
         Some(Err(e)) => {
            self.done = true;
            Err(e)
         },
         None => {
            self.done = true;
            Err(Error::LinkClosed)
         },
      }
   }

   /// Frames until the link closes.
   pub fn into_stream(self) -> impl Stream<Item = Frame> {
      stream::unfold(self, |mut rx| async move {
         rx.recv().await.ok().map(|frame| (frame, rx))
      })
   }

   fn close(&mut self) {
      self.done = true;
      self.rx.close();
   }
}

/// An open link to one peripheral.
///
/// Dropping the link closes it.
#[derive(Debug)]
pub struct Link {
   address: Address,
   sender: Option<LinkSender>,
   receiver: LinkReceiver,
   tasks: JoinSet<()>,
}

impl Link {
   pub(crate) fn new(
      address: Address,
      tx: mpsc::Sender<Command>,
      rx: mpsc::Receiver<Result<Frame>>,
      tasks: JoinSet<()>,
   ) -> Self {
      Self {
         address,
         sender: Some(LinkSender { tx }),
         receiver: LinkReceiver { rx, done: false },
         tasks,
      }
   }

   pub const fn address(&self) -> Address {
      self.address
   }

   pub fn is_open(&self) -> bool {
      self.sender.as_ref().is_some_and(LinkSender::is_connected)
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      match &self.sender {
         Some(sender) => sender.send(data).await,
         None => Err(Error::LinkClosed),
      }
   }

   pub async fn recv(&mut self) -> Result<Frame> {
      self.receiver.recv().await
   }

   /// Releases the link. Calling it again does nothing.
   pub fn close(&mut self) {
      if self.sender.take().is_some() {
         debug!("Closing link to {}", self.address);
      }
      self.receiver.close();
      self.tasks.abort_all();
   }
}

impl Drop for Link {
   fn drop(&mut self) {
      self.close();
   }
}
