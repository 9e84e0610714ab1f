//! Session manager for the daemon.
//!
//! Holds at most one [`Client`] per peripheral, connects the configured
//! `auto_connect` devices at start-up and brings them back after a session
//! ends in error.

use std::{collections::HashMap, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use rand::Rng;
use serde::Serialize;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   adapter::Adapter,
   att::DEFAULT_MTU,
   client::Client,
   config::Config,
   error::{Error, Result},
   event::{EventSender, SessionEvent},
   session::{CloseReason, SessionState},
   transport::AddressType,
};

/// Upper bound on the delay between reconnect attempts
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(120);
/// Time allowed for each session to close during shutdown
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Snapshot of a managed peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
   pub address: String,
   pub address_type: AddressType,
   pub name: SmolStr,
   pub state: SessionState,
   pub mtu: u16,
   pub services: usize,
   pub auto_connect: bool,
   pub reconnect_attempts: u32,
}

struct ManagedDevice {
   address_type: AddressType,
   name: SmolStr,
   auto_connect: bool,
   client: Option<Client>,
   connecting: bool,
   /// A disconnect arrived while the link was being opened.
   abandon_connect: bool,
   retry_count: u32,
   reconnect_handle: Option<JoinHandle<()>>,
}

impl ManagedDevice {
   const fn new(address_type: AddressType, name: SmolStr, auto_connect: bool) -> Self {
      Self {
         address_type,
         name,
         auto_connect,
         client: None,
         connecting: false,
         abandon_connect: false,
         retry_count: 0,
         reconnect_handle: None,
      }
   }

   fn is_live(&self) -> bool {
      self
         .client
         .as_ref()
         .is_some_and(|c| !c.state().is_terminal())
   }

   fn info(&self, address: Address) -> DeviceInfo {
      let (state, mtu, services) = match &self.client {
         Some(client) => (client.state(), client.mtu(), client.services().len()),
         None if self.connecting => (SessionState::Connecting, DEFAULT_MTU, 0),
         None => (SessionState::Disconnected, DEFAULT_MTU, 0),
      };
      DeviceInfo {
         address: address.to_string(),
         address_type: self.address_type,
         name: self.name.clone(),
         state,
         mtu,
         services,
         auto_connect: self.auto_connect,
         reconnect_attempts: self.retry_count,
      }
   }
}

enum ManagerCommand {
   // Session events
   SessionOpened(Address, Result<Client>, Option<Reply<()>>),
   SessionClosed(Address, CloseReason),

   // User commands; reconnect attempts carry no reply
   Connect(Address, AddressType, Option<Reply<()>>),
   Disconnect(Address, Reply<()>),
   GetClient(Address, Reply<Client>),
   GetDevices(oneshot::Sender<Vec<DeviceInfo>>),
}

/// Handle to the manager actor. Dropping it disconnects every session.
pub struct SessionManager {
   inbox: mpsc::Sender<ManagerCommand>,
   events: Option<EventSender>,
}

impl SessionManager {
   pub fn new(adapter: Adapter, config: Config) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let events = adapter.events();
      tokio::spawn(ManagerActor::new(adapter, config, command_rx).run());
      Self {
         inbox: command_tx,
         events,
      }
   }

   pub async fn connect(&self, address: Address, address_type: AddressType) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .send(ManagerCommand::Connect(address, address_type, Some(tx)))
         .await?;
      rx.await.map_err(|_| Error::ManagerShutdown)?
   }

   pub async fn disconnect(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self.send(ManagerCommand::Disconnect(address, tx)).await?;
      rx.await.map_err(|_| Error::ManagerShutdown)?
   }

   /// The session with `address`, for GATT operations.
   pub async fn client(&self, address: Address) -> Result<Client> {
      let (tx, rx) = oneshot::channel();
      self.send(ManagerCommand::GetClient(address, tx)).await?;
      rx.await.map_err(|_| Error::ManagerShutdown)?
   }

   pub async fn devices(&self) -> Vec<DeviceInfo> {
      let (tx, rx) = oneshot::channel();
      if self.send(ManagerCommand::GetDevices(tx)).await.is_err() {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   /// Subscribes to `handle` and reports each value as a
   /// [`SessionEvent::Notification`] on the adapter's event bus.
   pub async fn subscribe(&self, address: Address, handle: u16) -> Result<()> {
      let client = self.client(address).await?;
      let events = self.events.clone();
      client
         .subscribe_notifications(handle, move |handle, value| {
            if let Some(events) = &events {
               events.emit(address, SessionEvent::Notification {
                  handle,
                  value: value.to_vec(),
               });
            }
         })
         .await
   }

   pub async fn unsubscribe(&self, address: Address, handle: u16) -> Result<()> {
      self.client(address).await?.unsubscribe_notifications(handle).await
   }

   async fn send(&self, cmd: ManagerCommand) -> Result<()> {
      self
         .inbox
         .send(cmd)
         .await
         .map_err(|_| Error::ManagerShutdown)
   }
}

struct ManagerActor {
   adapter: Adapter,
   config: Config,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   devices: HashMap<Address, ManagedDevice>,
}

impl ManagerActor {
   fn new(adapter: Adapter, config: Config, command_rx: mpsc::Receiver<ManagerCommand>) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         adapter,
         config,
         command_rx,
         loopback_rx,
         loopback_tx,
         devices: HashMap::new(),
      }
   }

   async fn run(mut self) {
      info!("Session manager starting on {}", self.adapter.name());

      self.load_known_devices();

      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Session manager shutting down");
                  break;
               };
               self.handle_command(cmd);
            }
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd);
            }
         }
      }

      self.cleanup().await;
   }

   fn load_known_devices(&mut self) {
      for known in &self.config.known_devices {
         self.devices.insert(
            known.address,
            ManagedDevice::new(known.address_type, known.name.clone(), known.auto_connect),
         );
      }

      let auto: Vec<_> = self
         .config
         .auto_connect_devices()
         .map(|d| (d.address, d.address_type))
         .collect();
      for (addr, address_type) in auto {
         info!("Auto-connecting to {addr}");
         self.connect(addr, address_type, None);
      }
   }

   fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::SessionOpened(addr, result, reply) => {
            self.handle_session_opened(addr, result, reply);
         },
         ManagerCommand::SessionClosed(addr, reason) => {
            self.handle_session_closed(addr, reason);
         },
         ManagerCommand::Connect(addr, address_type, reply) => {
            self.connect(addr, address_type, reply);
         },
         ManagerCommand::Disconnect(addr, reply) => {
            self.disconnect(addr, reply);
         },
         ManagerCommand::GetClient(addr, reply) => {
            let result = match self.devices.get(&addr) {
               Some(device) => device.client.clone().ok_or(Error::NotConnected),
               None => Err(Error::DeviceNotFound(addr)),
            };
            let _ = reply.send(result);
         },
         ManagerCommand::GetDevices(reply) => {
            let mut devices: Vec<_> = self
               .devices
               .iter()
               .map(|(addr, device)| device.info(*addr))
               .collect();
            devices.sort_by(|a, b| a.address.cmp(&b.address));
            let _ = reply.send(devices);
         },
      }
   }

   fn connect(&mut self, addr: Address, address_type: AddressType, reply: Option<Reply<()>>) {
      let device = self.devices.entry(addr).or_insert_with(|| {
         ManagedDevice::new(address_type, SmolStr::default(), false)
      });

      if device.connecting {
         if let Some(reply) = reply {
            let _ = reply.send(Err(Error::AlreadyConnecting));
         }
         return;
      }
      if device.is_live() {
         if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
         }
         return;
      }

      if reply.is_some() {
         if let Some(handle) = device.reconnect_handle.take() {
            handle.abort();
         }
         device.retry_count = 0;
         device.address_type = address_type;
      }
      device.connecting = true;
      device.abandon_connect = false;

      let adapter = self.adapter.clone();
      let address_type = device.address_type;
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let result = Client::connect(&adapter, addr, address_type).await;
         let _ = loopback
            .send(ManagerCommand::SessionOpened(addr, result, reply))
            .await;
      });
   }

   fn handle_session_opened(
      &mut self,
      addr: Address,
      result: Result<Client>,
      reply: Option<Reply<()>>,
   ) {
      let loopback = self.loopback_tx.clone();
      let Some(device) = self.devices.get_mut(&addr) else {
         return;
      };
      device.connecting = false;

      let is_reconnect = reply.is_none();
      let result = match result {
         Ok(client) if device.abandon_connect => {
            debug!("Dropping session to {addr}, disconnect was requested while connecting");
            tokio::spawn(async move {
               let _ = client.disconnect().await;
            });
            Err(Error::Cancelled)
         },
         Ok(client) => {
            info!("Session to {addr} established");
            device.retry_count = 0;
            tokio::spawn(watch_session(loopback, addr, client.clone()));
            device.client = Some(client);
            Ok(())
         },
         Err(e) => {
            warn!("Failed to connect to {addr}: {e}");
            Err(e)
         },
      };

      let failed = result.is_err() && !device.abandon_connect;
      device.abandon_connect = false;
      if let Some(reply) = reply {
         let _ = reply.send(result);
      }
      if failed && is_reconnect {
         self.schedule_reconnect(addr);
      }
   }

   fn handle_session_closed(&mut self, addr: Address, reason: CloseReason) {
      let Some(device) = self.devices.get_mut(&addr) else {
         return;
      };
      if device.is_live() {
         debug!("Ignoring close of a replaced session to {addr}");
         return;
      }

      device.client = None;
      info!("Session to {addr} closed: {reason}");
      if reason.is_error() && device.auto_connect {
         self.schedule_reconnect(addr);
      }
   }

   fn schedule_reconnect(&mut self, addr: Address) {
      let max_attempts = self.config.max_reconnect_attempts;
      let base_delay = Duration::from_secs(self.config.reconnect_delay_sec);
      let loopback = self.loopback_tx.clone();
      let Some(device) = self.devices.get_mut(&addr) else {
         return;
      };

      if device.retry_count >= max_attempts {
         warn!("Giving up on {addr} after {max_attempts} reconnect attempts");
         return;
      }
      device.retry_count += 1;

      let delay = calc_retry_delay(base_delay, device.retry_count);
      let address_type = device.address_type;
      info!(
         "Reconnecting to {addr} in {delay:?} (attempt {}/{max_attempts})",
         device.retry_count
      );
      device.reconnect_handle = Some(tokio::spawn(async move {
         time::sleep(delay).await;
         let _ = loopback
            .send(ManagerCommand::Connect(addr, address_type, None))
            .await;
      }));
   }

   fn disconnect(&mut self, addr: Address, reply: Reply<()>) {
      let Some(device) = self.devices.get_mut(&addr) else {
         let _ = reply.send(Err(Error::DeviceNotFound(addr)));
         return;
      };

      if let Some(handle) = device.reconnect_handle.take() {
         handle.abort();
      }
      device.retry_count = 0;
      if device.connecting {
         device.abandon_connect = true;
      }

      match device.client.take() {
         Some(client) => {
            tokio::spawn(async move {
               let _ = reply.send(client.disconnect().await);
            });
         },
         None => {
            let _ = reply.send(Ok(()));
         },
      }
   }

   async fn cleanup(&mut self) {
      info!("Closing all sessions");
      for device in self.devices.values_mut() {
         if let Some(handle) = device.reconnect_handle.take() {
            handle.abort();
         }
         if let Some(client) = device.client.take() {
            let _ = time::timeout(DISCONNECT_TIMEOUT, client.disconnect()).await;
         }
      }
   }
}

/// Reports the end of `client`'s session back to the manager.
async fn watch_session(loopback: mpsc::Sender<ManagerCommand>, addr: Address, client: Client) {
   let reason = client.closed().await;
   drop(client);
   let _ = loopback
      .send(ManagerCommand::SessionClosed(addr, reason))
      .await;
}

fn calc_retry_delay(base_delay: Duration, retry_count: u32) -> Duration {
   let delay = base_delay
      .checked_mul(1 << retry_count.min(4))
      .map_or(MAX_RECONNECT_DELAY, |d| d.min(MAX_RECONNECT_DELAY));
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}
