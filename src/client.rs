//! Client API.
//!
//! A [`Client`] is a cheap, clonable handle to one session. Every operation
//! is sent to the session worker and awaited; operations issued concurrently
//! are answered in the order they were issued.

use std::sync::Arc;

use bluer::Address;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::{
   adapter::Adapter,
   att::{AttUuid, DEFAULT_MTU, MAX_MTU},
   config::SessionConfig,
   error::{Error, Result},
   event::SessionEvent,
   gatt::{Characteristic, Descriptor, Service},
   session::{
      self, CloseReason, Command, NotificationCallback, SessionState, Shared,
      mux::Job,
      procedure::{Outcome, Procedure},
   },
   transport::AddressType,
};

/// ATT header bytes in a write PDU.
const WRITE_HEADER_LEN: usize = 3;

#[derive(Clone)]
pub struct Client {
   commands: mpsc::Sender<Command>,
   shared: Arc<Shared>,
}

impl Client {
   /// Connects with the adapter's session defaults.
   pub async fn connect(
      adapter: &Adapter,
      address: Address,
      address_type: AddressType,
   ) -> Result<Self> {
      Self::connect_with(adapter, address, address_type, *adapter.config()).await
   }

   pub async fn connect_with(
      adapter: &Adapter,
      address: Address,
      address_type: AddressType,
      config: SessionConfig,
   ) -> Result<Self> {
      let shared = Arc::new(Shared::new(address, adapter.events()));
      shared.set_state(SessionState::Connecting);
      info!("Connecting to {address} ({address_type}) via {}", adapter.name());

      let link = match adapter
         .transport()
         .open(address, address_type, config.connect_timeout)
         .await
      {
         Ok(link) => link,
         Err(e) => {
            warn!("Failed to connect to {address}: {e}");
            shared.set_state(SessionState::Disconnected);
            return Err(e);
         },
      };

      shared.set_state(SessionState::Connected);
      shared.emit(SessionEvent::Connected);
      let commands = session::spawn(link, shared.clone(), config.request_timeout);
      let client = Self { commands, shared };

      if config.preferred_mtu > DEFAULT_MTU {
         match client.exchange_mtu(config.preferred_mtu).await {
            Ok(mtu) => debug!("{address}: Negotiated MTU {mtu}"),
            Err(e) if e.att_code().is_some() => {
               warn!("{address}: MTU exchange rejected, staying at {DEFAULT_MTU}: {e}");
            },
            Err(e) => return Err(e),
         }
      }
      Ok(client)
   }

   pub fn address(&self) -> Address {
      self.shared.address
   }

   pub fn state(&self) -> SessionState {
      self.shared.state()
   }

   pub fn mtu(&self) -> u16 {
      self.shared.mtu()
   }

   /// Services found by the last discovery.
   pub fn services(&self) -> Vec<Service> {
      self.shared.cache.read().services().to_vec()
   }

   /// Every characteristic discovered so far.
   pub fn characteristics(&self) -> Vec<Characteristic> {
      self.shared.cache.read().characteristics().copied().collect()
   }

   /// Resolves once the session has ended.
   pub async fn closed(&self) -> CloseReason {
      self.shared.closed().await
   }

   pub async fn discover_services(&self) -> Result<Vec<Service>> {
      self.ensure(SessionState::accepts_discovery)?;
      match self.submit(Procedure::discover_services()).await? {
         Outcome::Services(services) => Ok(services),
         _ => Err(Error::Internal("service discovery returned the wrong outcome")),
      }
   }

   pub async fn discover_characteristics(&self, service: &Service) -> Result<Vec<Characteristic>> {
      self.ensure(SessionState::accepts_requests)?;
      match self.submit(Procedure::discover_characteristics(*service)).await? {
         Outcome::Characteristics(chars) => Ok(chars),
         _ => Err(Error::Internal("characteristic discovery returned the wrong outcome")),
      }
   }

   pub async fn discover_descriptors(
      &self,
      characteristic: &Characteristic,
   ) -> Result<Vec<Descriptor>> {
      self.ensure(SessionState::accepts_requests)?;
      match self.submit(Procedure::discover_descriptors(characteristic)).await? {
         Outcome::Descriptors(descriptors) => Ok(descriptors),
         _ => Err(Error::Internal("descriptor discovery returned the wrong outcome")),
      }
   }

   /// Reads a value, following up with blob reads when it does not fit one
   /// response.
   pub async fn read_characteristic(&self, handle: u16) -> Result<Vec<u8>> {
      self.ensure(SessionState::accepts_requests)?;
      check_handle(handle)?;
      match self.submit(Procedure::read(handle, self.mtu())).await? {
         Outcome::Value(value) => Ok(value),
         _ => Err(Error::Internal("read returned the wrong outcome")),
      }
   }

   /// Reads every attribute of type `uuid` in `start..=end`.
   pub async fn read_by_uuid(
      &self,
      start: u16,
      end: u16,
      uuid: AttUuid,
   ) -> Result<Vec<(u16, Vec<u8>)>> {
      self.ensure(SessionState::accepts_requests)?;
      check_handle(start)?;
      if end < start {
         return Err(Error::InvalidArgument(format!(
            "empty handle range 0x{start:04x}..=0x{end:04x}"
         )));
      }
      match self.submit(Procedure::read_by_uuid(start, end, uuid)).await? {
         Outcome::HandleValues(values) => Ok(values),
         _ => Err(Error::Internal("read by type returned the wrong outcome")),
      }
   }

   /// Writes a value. Without response the call completes once the PDU is
   /// on the link.
   pub async fn write_characteristic(
      &self,
      handle: u16,
      value: &[u8],
      with_response: bool,
   ) -> Result<()> {
      self.ensure(SessionState::accepts_requests)?;
      check_handle(handle)?;
      let limit = usize::from(self.mtu()).saturating_sub(WRITE_HEADER_LEN);
      if value.len() > limit {
         return Err(Error::InvalidArgument(format!(
            "{} byte value exceeds the {limit} byte write limit",
            value.len()
         )));
      }

      if with_response {
         let procedure = Procedure::Write {
            handle,
            value: value.to_vec(),
         };
         return self.submit(procedure).await.map(drop);
      }

      let (reply, rx) = oneshot::channel();
      self
         .send(Command::WriteCommand {
            handle,
            value: value.to_vec(),
            reply,
         })
         .await?;
      rx.await.map_err(|_| Error::Cancelled)?
   }

   /// Enables notifications (or indications, for indicate-only
   /// characteristics) on the characteristic with this value handle.
   ///
   /// The callback runs on the session's delivery task and must not block.
   pub async fn subscribe_notifications<F>(&self, handle: u16, callback: F) -> Result<()>
   where
      F: Fn(u16, &[u8]) + Send + Sync + 'static,
   {
      self.ensure(SessionState::accepts_requests)?;
      let (cccd, value) = self.cccd_for(handle)?;
      let (job, rx) = Job::new(Procedure::ConfigureCccd {
         value_handle: handle,
         cccd,
         value,
      });
      let callback: NotificationCallback = Arc::new(callback);
      self
         .send(Command::Subscribe {
            handle,
            callback,
            job,
         })
         .await?;
      rx.await.map_err(|_| Error::Cancelled)?.map(drop)
   }

   pub async fn unsubscribe_notifications(&self, handle: u16) -> Result<()> {
      self.ensure(SessionState::accepts_requests)?;
      let (cccd, _) = self.cccd_for(handle)?;
      let (job, rx) = Job::new(Procedure::ConfigureCccd {
         value_handle: handle,
         cccd,
         value: 0x0000,
      });
      self.send(Command::Unsubscribe { handle, job }).await?;
      rx.await.map_err(|_| Error::Cancelled)?.map(drop)
   }

   /// Negotiates the ATT MTU and returns the value now in force.
   pub async fn exchange_mtu(&self, mtu: u16) -> Result<u16> {
      self.ensure(SessionState::accepts_discovery)?;
      if !(DEFAULT_MTU..=MAX_MTU).contains(&mtu) {
         return Err(Error::InvalidArgument(format!(
            "MTU {mtu} outside {DEFAULT_MTU}..={MAX_MTU}"
         )));
      }
      match self.submit(Procedure::ExchangeMtu { client_mtu: mtu }).await? {
         Outcome::Mtu(mtu) => Ok(mtu),
         _ => Err(Error::Internal("MTU exchange returned the wrong outcome")),
      }
   }

   /// Ends the session. Every outstanding request resolves with `Cancelled`.
   pub async fn disconnect(&self) -> Result<()> {
      let state = self.state();
      if state.is_terminal() {
         if state == SessionState::Error {
            self.shared.set_state(SessionState::Disconnected);
         }
         return Ok(());
      }

      let (reply, rx) = oneshot::channel();
      if self.commands.send(Command::Disconnect { reply }).await.is_ok() {
         let _ = rx.await;
      }
      Ok(())
   }

   fn ensure(&self, accepts: fn(SessionState) -> bool) -> Result<()> {
      if accepts(self.state()) {
         Ok(())
      } else {
         Err(Error::NotConnected)
      }
   }

   fn cccd_for(&self, handle: u16) -> Result<(u16, u16)> {
      check_handle(handle)?;
      let cache = self.shared.cache.read();
      let cccd = match cache.cccd_handle(handle) {
         Some(cccd) => cccd,
         None => handle
            .checked_add(1)
            .ok_or_else(|| Error::InvalidArgument("no room for a CCCD after 0xffff".into()))?,
      };
      let value = cache
         .characteristic(handle)
         .map_or(0x0001, Characteristic::subscribe_value);
      Ok((cccd, value))
   }

   async fn send(&self, command: Command) -> Result<()> {
      self.commands.send(command).await.map_err(|_| Error::NotConnected)
   }

   async fn submit(&self, procedure: Procedure) -> Result<Outcome> {
      let (job, rx) = Job::new(procedure);
      self.send(Command::Submit(job)).await?;
      rx.await.map_err(|_| Error::Cancelled)?
   }
}

fn check_handle(handle: u16) -> Result<()> {
   if handle == 0 {
      return Err(Error::InvalidArgument("handle 0x0000 is reserved".into()));
   }
   Ok(())
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use parking_lot::Mutex;

   use super::*;
   use crate::{
      att::{AttErrorCode, Request},
      gatt::sim::{SimHandle, SimPeripheral},
      transport::memory::{MemoryPeer, MemoryTransport, OpenBehavior, PeerAcceptor},
   };

   fn peer_address() -> Address {
      Address::new([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x10])
   }

   fn config() -> SessionConfig {
      SessionConfig {
         request_timeout: Duration::from_millis(200),
         ..SessionConfig::default()
      }
   }

   fn adapter() -> (Adapter, PeerAcceptor) {
      let (transport, acceptor) = MemoryTransport::new();
      (Adapter::with_transport("sim0", transport, config()), acceptor)
   }

   async fn connect(sim: SimPeripheral) -> (Client, SimHandle) {
      let (adapter, mut acceptor) = adapter();
      let client = Client::connect(&adapter, peer_address(), AddressType::Public)
         .await
         .unwrap();
      let peer = acceptor.accept().await.unwrap();
      (client, sim.spawn(peer))
   }

   /// Connects without a simulated server; the test plays the peer by hand.
   async fn connect_bare() -> (Client, MemoryPeer) {
      let (adapter, mut acceptor) = adapter();
      let client = Client::connect(&adapter, peer_address(), AddressType::Public)
         .await
         .unwrap();
      (client, acceptor.accept().await.unwrap())
   }

   async fn ready(sim: SimPeripheral) -> (Client, SimHandle) {
      let (client, handle) = connect(sim).await;
      client.discover_services().await.unwrap();
      (client, handle)
   }

   #[tokio::test]
   async fn test_device_name_scenario() {
      let (client, sim) = connect(SimPeripheral::device_name("bluepy")).await;
      assert_eq!(client.state(), SessionState::Connected);

      let services = client.discover_services().await.unwrap();
      assert_eq!(client.state(), SessionState::Ready);
      assert_eq!(services.len(), 1);
      assert_eq!(services[0].uuid, AttUuid::Uuid16(0x1800));
      assert_eq!(client.services(), services);

      let chars = client.discover_characteristics(&services[0]).await.unwrap();
      assert_eq!(chars.len(), 1);
      let name = chars[0];
      assert_eq!(name.value_handle, 0x0010);
      assert_eq!(name.uuid, AttUuid::Uuid16(0x2A00));
      assert_eq!(name.end_handle, 0x0011);

      let descriptors = client.discover_descriptors(&name).await.unwrap();
      assert_eq!(descriptors.len(), 1);
      assert_eq!(descriptors[0].handle, 0x0011);

      assert_eq!(client.read_characteristic(0x0010).await.unwrap(), b"bluepy");
      client
         .write_characteristic(0x0010, b"renamed", true)
         .await
         .unwrap();
      assert_eq!(client.read_characteristic(0x0010).await.unwrap(), b"renamed");

      let (tx, mut rx) = mpsc::unbounded_channel();
      client
         .subscribe_notifications(0x0010, move |handle, value| {
            let _ = tx.send((handle, value.to_vec()));
         })
         .await
         .unwrap();
      assert!(sim.requests().contains(&Request::Write {
         handle: 0x0011,
         value: vec![0x01, 0x00],
      }));

      sim.notify(0x0010, &[0xDE, 0xAD]);
      let (handle, value) = rx.recv().await.unwrap();
      assert_eq!(handle, 0x0010);
      assert_eq!(value, vec![0xDE, 0xAD]);

      client.unsubscribe_notifications(0x0010).await.unwrap();
      client.disconnect().await.unwrap();
      assert_eq!(client.state(), SessionState::Disconnected);
      assert_eq!(client.closed().await, CloseReason::Requested);
      assert!(client.services().is_empty());
   }

   #[tokio::test]
   async fn test_requests_resolve_in_issue_order() {
      let (client, _sim) = ready(SimPeripheral::device_name("abc")).await;
      let order = Arc::new(Mutex::new(Vec::new()));

      let read = |tag: u8| {
         let client = client.clone();
         let order = order.clone();
         async move {
            let value = client.read_characteristic(0x0010).await;
            order.lock().push(tag);
            value
         }
      };
      let (r1, r2, r3) = tokio::join!(read(1), read(2), read(3));

      assert!(r1.is_ok() && r2.is_ok() && r3.is_ok());
      assert_eq!(*order.lock(), vec![1, 2, 3]);
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
   async fn test_slow_callback_does_not_delay_requests() {
      let (client, sim) = ready(SimPeripheral::device_name("abc")).await;
      let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
      let gate_rx = Mutex::new(gate_rx);
      let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

      client
         .subscribe_notifications(0x0010, move |_, value| {
            let _ = seen_tx.send(value.to_vec());
            tokio::task::block_in_place(|| {
               let _ = gate_rx.lock().recv_timeout(Duration::from_secs(5));
            });
         })
         .await
         .unwrap();

      sim.notify(0x0010, &[1]);
      assert_eq!(seen_rx.recv().await.unwrap(), vec![1]);

      // the callback is now blocked; requests still complete
      let value = tokio::time::timeout(Duration::from_secs(2), client.read_characteristic(0x0010))
         .await
         .unwrap()
         .unwrap();
      assert_eq!(value, b"abc");

      sim.notify(0x0010, &[2]);
      gate_tx.send(()).unwrap();
      assert_eq!(seen_rx.recv().await.unwrap(), vec![2]);
      let _ = gate_tx.send(());
   }

   #[tokio::test]
   async fn test_indications_are_confirmed() {
      let (client, sim) = ready(SimPeripheral::device_name("abc")).await;
      let (tx, mut rx) = mpsc::unbounded_channel();
      client
         .subscribe_notifications(0x0010, move |_, value| {
            let _ = tx.send(value.to_vec());
         })
         .await
         .unwrap();

      sim.indicate(0x0010, &[7]);
      assert_eq!(rx.recv().await.unwrap(), vec![7]);
      // a round trip after the indication guarantees the confirmation was sent
      client.read_characteristic(0x0010).await.unwrap();
      assert_eq!(sim.record.lock().confirmations, 1);
   }

   #[tokio::test]
   async fn test_disconnect_cancels_pending() {
      let (client, sim) = ready(SimPeripheral::device_name("abc")).await;
      sim.go_silent();

      let mut pending = Vec::new();
      for _ in 0..4 {
         let client = client.clone();
         pending.push(tokio::spawn(async move { client.read_characteristic(0x0010).await }));
      }
      while sim.requests().iter().filter(|r| matches!(r, Request::Read { .. })).count() < 1 {
         tokio::task::yield_now().await;
      }
      tokio::task::yield_now().await;

      client.disconnect().await.unwrap();
      for task in pending {
         assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));
      }
      assert_eq!(client.state(), SessionState::Disconnected);
   }

   #[tokio::test]
   async fn test_timeout_moves_session_to_error() {
      let (client, sim) = ready(SimPeripheral::device_name("abc")).await;
      sim.go_silent();

      let res = client.read_characteristic(0x0010).await;
      assert!(matches!(res, Err(Error::Timeout)));
      assert_eq!(client.state(), SessionState::Error);
      assert_eq!(client.closed().await, CloseReason::Timeout);

      let res = client.read_characteristic(0x0010).await;
      assert!(matches!(res, Err(Error::NotConnected)));

      client.disconnect().await.unwrap();
      assert_eq!(client.state(), SessionState::Disconnected);
   }

   #[tokio::test]
   async fn test_link_loss_cancels_and_disconnects() {
      let (client, sim) = ready(SimPeripheral::device_name("abc")).await;
      sim.disconnect();
      assert_eq!(client.closed().await, CloseReason::LinkLost);
      assert_eq!(client.state(), SessionState::Disconnected);
      assert!(matches!(
         client.read_characteristic(0x0010).await,
         Err(Error::NotConnected)
      ));
   }

   #[tokio::test]
   async fn test_requests_before_discovery_fail_fast() {
      let (client, sim) = connect(SimPeripheral::device_name("abc")).await;
      assert!(matches!(
         client.read_characteristic(0x0010).await,
         Err(Error::NotConnected)
      ));
      assert!(sim.requests().is_empty());
   }

   #[tokio::test]
   async fn test_requests_queue_behind_discovery() {
      let (client, _sim) = connect(SimPeripheral::device_name("abc")).await;
      let discovery = {
         let client = client.clone();
         tokio::spawn(async move { client.discover_services().await })
      };
      while client.state() == SessionState::Connected {
         tokio::task::yield_now().await;
      }
      let value = client.read_characteristic(0x0010).await.unwrap();
      assert_eq!(value, b"abc");
      assert_eq!(discovery.await.unwrap().unwrap().len(), 1);
   }

   #[tokio::test]
   async fn test_protocol_error_reaches_only_its_caller() {
      let (client, _sim) = ready(SimPeripheral::device_name("abc")).await;
      let err = client.read_characteristic(0x0042).await.unwrap_err();
      assert_eq!(err.att_code(), Some(AttErrorCode::InvalidHandle));
      assert_eq!(client.state(), SessionState::Ready);
      assert!(client.read_characteristic(0x0010).await.is_ok());
   }

   #[tokio::test]
   async fn test_long_values_use_blob_reads() {
      let long_name = "a device name longer than one ATT response";
      let (client, sim) = ready(SimPeripheral::device_name(long_name)).await;
      let value = client.read_characteristic(0x0010).await.unwrap();
      assert_eq!(value, long_name.as_bytes());
      assert!(sim
         .requests()
         .iter()
         .any(|r| matches!(r, Request::ReadBlob { handle: 0x0010, offset: 22 })));
   }

   #[tokio::test]
   async fn test_oversized_write_is_rejected_locally() {
      let (client, sim) = ready(SimPeripheral::device_name("abc")).await;
      let before = sim.requests().len();
      let res = client.write_characteristic(0x0010, &[0u8; 21], true).await;
      assert!(matches!(res, Err(Error::InvalidArgument(_))));
      assert_eq!(sim.requests().len(), before);
   }

   #[tokio::test]
   async fn test_write_without_response() {
      let (client, _sim) = ready(SimPeripheral::device_name("abc")).await;
      client.write_characteristic(0x0010, b"xyz", false).await.unwrap();
      assert_eq!(client.read_characteristic(0x0010).await.unwrap(), b"xyz");
   }

   #[tokio::test]
   async fn test_read_by_uuid() {
      let (client, _sim) = ready(SimPeripheral::device_name("abc")).await;
      let values = client
         .read_by_uuid(0x0001, 0xFFFF, AttUuid::Uuid16(0x2A00))
         .await
         .unwrap();
      assert_eq!(values, vec![(0x0010, b"abc".to_vec())]);
   }

   #[tokio::test]
   async fn test_exchange_mtu() {
      let (client, _sim) = connect(SimPeripheral::device_name("abc")).await;
      assert_eq!(client.exchange_mtu(185).await.unwrap(), 23);
      assert_eq!(client.mtu(), 23);
      assert!(matches!(client.exchange_mtu(10).await, Err(Error::InvalidArgument(_))));
   }

   #[tokio::test]
   async fn test_undersized_server_mtu_is_raised_to_minimum() {
      let (client, mut peer) = connect_bare().await;
      let peer_side = async {
         assert_eq!(peer.recv().await.unwrap().as_slice(), &[0x02, 0x64, 0x00]);
         assert!(peer.send(&[0x03, 0x01, 0x00]).await);
      };
      let (mtu, ()) = tokio::join!(client.exchange_mtu(100), peer_side);
      assert_eq!(mtu.unwrap(), 23);
      assert_eq!(client.mtu(), 23);
   }

   #[tokio::test(start_paused = true)]
   async fn test_stalled_link_times_out_at_request_deadline() {
      let (client, _peer) = connect_bare().await;
      let started = tokio::time::Instant::now();

      let res = client.discover_services().await;
      assert!(matches!(res, Err(Error::Timeout)));
      assert!(started.elapsed() < Duration::from_secs(1));
      assert_eq!(client.closed().await, CloseReason::Timeout);
      assert_eq!(client.state(), SessionState::Error);

      client.disconnect().await.unwrap();
      assert_eq!(client.state(), SessionState::Disconnected);
   }

   #[tokio::test]
   async fn test_peer_requests_are_answered() {
      let (client, mut peer) = connect_bare().await;

      assert!(peer.send(&[0x02, 0x17, 0x00]).await);
      assert_eq!(peer.recv().await.unwrap().as_slice(), &[0x03, 0x17, 0x00]);

      assert!(peer.send(&[0x0A, 0x01, 0x00]).await);
      assert_eq!(
         peer.recv().await.unwrap().as_slice(),
         &[0x01, 0x0A, 0x00, 0x00, 0x06]
      );
      assert_eq!(client.state(), SessionState::Connected);
   }

   #[tokio::test]
   async fn test_unknown_peer_requests_are_rejected() {
      let (client, mut peer) = connect_bare().await;

      assert!(peer.send(&[0x20, 0x01]).await);
      assert_eq!(
         peer.recv().await.unwrap().as_slice(),
         &[0x01, 0x20, 0x00, 0x00, 0x06]
      );

      // unknown commands get no answer
      assert!(peer.send(&[0x60, 0x01]).await);
      assert!(peer.send(&[0x02, 0x17, 0x00]).await);
      assert_eq!(peer.recv().await.unwrap().as_slice(), &[0x03, 0x17, 0x00]);
      assert_eq!(client.state(), SessionState::Connected);
   }

   #[tokio::test]
   async fn test_connect_failures_leave_nothing_behind() {
      let (transport, _acceptor) = MemoryTransport::new();
      transport.set_behavior(OpenBehavior::Refuse);
      let adapter = Adapter::with_transport("sim0", transport, config());
      let res = Client::connect(&adapter, peer_address(), AddressType::Public).await;
      assert!(matches!(res, Err(Error::Connection(_))));

      let (transport, _acceptor) = MemoryTransport::new();
      transport.set_behavior(OpenBehavior::DenyPermission);
      let adapter = Adapter::with_transport("sim0", transport, config());
      let res = Client::connect(&adapter, peer_address(), AddressType::Public).await;
      assert!(matches!(res, Err(Error::Permission(_))));
   }
}
