//! BlueZ L2CAP transport.
//!
//! ATT runs on the fixed LE channel 0x0004. The socket is split into a
//! receive pump and a send pump, each its own task, feeding the queues of a
//! [`Link`].

use std::{io, sync::Arc, time::Duration};

use bluer::{
   Address,
   l2cap::{Security, SeqPacket, Socket, SocketAddr},
};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::{sync::mpsc, task::JoinSet, time};

use crate::{
   att::ATT_CID,
   error::{Error, Result},
   transport::{
      AddressType, Command, Frame, LINK_QUEUE_DEPTH, Link, SecurityLevel, Transport,
   },
};

/// Receive buffer, larger than any ATT_MTU.
const L2CAP_MTU: usize = 672;

/// Opens ATT links through a local BlueZ adapter.
#[derive(Debug, Clone)]
pub struct L2capTransport {
   adapter_address: Address,
   security: SecurityLevel,
}

impl L2capTransport {
   /// Resolves `adapter_name` (e.g. `hci0`) through bluetoothd, powering it on
   /// if needed.
   pub async fn new(adapter_name: &str, security: SecurityLevel) -> Result<Self> {
      let session = bluer::Session::new().await?;
      let adapter = session
         .adapter(adapter_name)
         .map_err(|_| Error::AdapterNotFound(adapter_name.to_string()))?;

      if let Ok(powered) = adapter.is_powered().await
         && !powered
      {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {adapter_name}");
      }

      let adapter_address = adapter.address().await?;
      info!("Using adapter {adapter_name} ({adapter_address})");
      Ok(Self::with_address(adapter_address, security))
   }

   pub const fn with_address(adapter_address: Address, security: SecurityLevel) -> Self {
      Self {
         adapter_address,
         security,
      }
   }

   async fn connect(
      &self,
      address: Address,
      address_type: AddressType,
      timeout: Duration,
   ) -> Result<Link> {
      debug!("Creating L2CAP socket for {address}");

      let socket = Socket::new_seq_packet().map_err(connect_error)?;

      let mut local = SocketAddr::new(self.adapter_address, bluer::AddressType::LePublic, 0);
      local.cid = ATT_CID;
      socket.bind(local).map_err(connect_error)?;

      if let Some(level) = self.security_level() {
         socket
            .set_security(Security { level, key_size: 0 })
            .map_err(connect_error)?;
      }

      let mut remote = SocketAddr::new(address, address_type.into(), 0);
      remote.cid = ATT_CID;
      debug!("Connecting to {address} ({address_type}) on CID {ATT_CID:#06x}");

      let seq_packet = time::timeout(timeout, socket.connect(remote))
         .await
         .map_err(|_| Error::Connection(format!("connection to {address} timed out")))?
         .map_err(connect_error)?;

      let (cmd_tx, cmd_rx) = mpsc::channel(LINK_QUEUE_DEPTH);
      let (in_tx, in_rx) = mpsc::channel(LINK_QUEUE_DEPTH);

      let seq_packet = Arc::new(seq_packet);
      let mut tasks = JoinSet::new();
      tasks.spawn(recv_thread(address, in_tx, seq_packet.clone()));
      tasks.spawn(send_thread(address, cmd_rx, seq_packet));

      Ok(Link::new(address, cmd_tx, in_rx, tasks))
   }

   const fn security_level(&self) -> Option<bluer::l2cap::SecurityLevel> {
      match self.security {
         SecurityLevel::Low => None,
         SecurityLevel::Medium => Some(bluer::l2cap::SecurityLevel::Medium),
         SecurityLevel::High => Some(bluer::l2cap::SecurityLevel::High),
      }
   }
}

impl Transport for L2capTransport {
   fn open(
      &self,
      address: Address,
      address_type: AddressType,
      timeout: Duration,
   ) -> BoxFuture<'_, Result<Link>> {
      Box::pin(self.connect(address, address_type, timeout))
   }
}

/// Splits OS failures into privilege problems and everything else.
fn connect_error(e: io::Error) -> Error {
   match e.kind() {
      io::ErrorKind::PermissionDenied => Error::Permission(e.to_string()),
      _ if e.raw_os_error() == Some(1) => Error::Permission(e.to_string()),
      _ => Error::Connection(e.to_string()),
   }
}

async fn recv_thread(adr: Address, tx: mpsc::Sender<Result<Frame>>, sp: Arc<SeqPacket>) {
   let mut stack = [0u8; L2CAP_MTU];
   loop {
      match sp.recv(&mut stack).await {
         Ok(0) => {
            warn!("{adr}: Connection lost");
            let _ = tx.send(Err(Error::LinkClosed)).await;
            return;
         },
         Ok(n) => {
            let recvd = &stack[..n];
            debug!("← {adr}: {}", hex::encode(recvd));
            if tx.send(Ok(Frame::from_slice(recvd))).await.is_err() {
               debug!("{adr}: Receiver dropped");
               return;
            }
         },
         Err(e) => {
            warn!("{adr}: Receive failed: {e}");
            let _ = tx.send(Err(Error::LinkClosed)).await;
            return;
         },
      }
   }
}

async fn send_thread(adr: Address, mut rx: mpsc::Receiver<Command>, sp: Arc<SeqPacket>) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            if let Err(e) = sp.send(&data).await {
               warn!("{adr}: Failed to send data: {e}");
               let _ = then.send(Err(Error::Io(e)));
            } else {
               let _ = then.send(Ok(()));
            }
         },
      }
   }
   debug!("{adr}: Sender closed");
}
