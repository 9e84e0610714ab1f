//! Per-connection session.
//!
//! Each session is driven by one worker task that owns the link, the
//! request queue and the subscription table. Client handles reach it only
//! through the command queue and read its state from [`Shared`].

use std::{sync::Arc, time::Duration};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::{
   sync::{Notify, mpsc, oneshot},
   time::{self, Instant},
};

use crate::{
   att::{
      self, AttErrorCode, DEFAULT_MTU, DecodedMessage, ErrorResponse, Opcode, Request, Response,
   },
   error::{Error, Result},
   event::{EventSender, SessionEvent},
   gatt::GattCache,
   transport::Link,
};

pub mod mux;
pub(crate) mod procedure;

pub use mux::NotificationCallback;
use mux::{Delivery, Job, Multiplexer};

/// Depth of the command queue shared by all client handles.
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Lifecycle of a session.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   strum::Display,
   strum::IntoStaticStr,
   strum::EnumString,
)]
pub enum SessionState {
   Disconnected,
   Connecting,
   Connected,
   Discovering,
   Ready,
   Disconnecting,
   Error,
}

impl SessionState {
   pub const fn is_terminal(self) -> bool {
      matches!(self, Self::Disconnected | Self::Error)
   }

   /// States in which read, write and subscribe are accepted. Requests made
   /// while discovering queue behind it.
   pub const fn accepts_requests(self) -> bool {
      matches!(self, Self::Ready | Self::Discovering)
   }

   /// States in which service discovery and MTU exchange are accepted.
   pub const fn accepts_discovery(self) -> bool {
      matches!(self, Self::Connected | Self::Ready | Self::Discovering)
   }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum CloseReason {
   /// `disconnect()` was called or every client handle was dropped.
   Requested,
   LinkLost,
   /// A request went unanswered.
   Timeout,
   /// Writing to the link failed.
   TransportFailure,
}

impl CloseReason {
   pub const fn is_error(self) -> bool {
      !matches!(self, Self::Requested)
   }

   const fn final_state(self) -> SessionState {
      match self {
         Self::Requested | Self::LinkLost => SessionState::Disconnected,
         Self::Timeout | Self::TransportFailure => SessionState::Error,
      }
   }
}

/// State readable from any client handle. Only the worker writes it while
/// the session is alive.
pub(crate) struct Shared {
   pub address: Address,
   state: AtomicCell<SessionState>,
   mtu: AtomicCell<u16>,
   pub cache: RwLock<GattCache>,
   close_reason: Mutex<Option<CloseReason>>,
   changed: Notify,
   events: Option<EventSender>,
}

impl Shared {
   pub fn new(address: Address, events: Option<EventSender>) -> Self {
      Self {
         address,
         state: AtomicCell::new(SessionState::Disconnected),
         mtu: AtomicCell::new(DEFAULT_MTU),
         cache: RwLock::new(GattCache::default()),
         close_reason: Mutex::new(None),
         changed: Notify::new(),
         events,
      }
   }

   pub fn state(&self) -> SessionState {
      self.state.load()
   }

   pub fn set_state(&self, new: SessionState) {
      let old = self.state.swap(new);
      if old != new {
         info!("{}: {old} → {new}", self.address);
         self.emit(SessionEvent::StateChanged(new));
         self.changed.notify_waiters();
      }
   }

   pub fn mtu(&self) -> u16 {
      self.mtu.load()
   }

   pub fn set_mtu(&self, mtu: u16) {
      if self.mtu.swap(mtu) != mtu {
         info!("{}: ATT MTU is now {mtu}", self.address);
      }
   }

   pub fn emit(&self, event: SessionEvent) {
      if let Some(events) = &self.events {
         events.emit(self.address, event);
      }
   }

   pub fn close_reason(&self) -> Option<CloseReason> {
      *self.close_reason.lock()
   }

   /// Records the end of the session and moves to its final state.
   fn close(&self, reason: CloseReason) {
      self.cache.write().clear();
      self.mtu.store(DEFAULT_MTU);
      *self.close_reason.lock() = Some(reason);
      self.set_state(reason.final_state());
      self.emit(SessionEvent::Disconnected(reason));
      self.changed.notify_waiters();
   }

   /// Waits for the session to end.
   pub async fn closed(&self) -> CloseReason {
      loop {
         let changed = self.changed.notified();
         if let Some(reason) = self.close_reason() {
            return reason;
         }
         changed.await;
      }
   }
}

pub(crate) enum Command {
   Submit(Job),
   /// Registers `callback` on `handle`, then runs the CCCD write in `job`.
   Subscribe {
      handle: u16,
      callback: NotificationCallback,
      job: Job,
   },
   Unsubscribe {
      handle: u16,
      job: Job,
   },
   /// Write Command; completes once the PDU is on the link.
   WriteCommand {
      handle: u16,
      value: Vec<u8>,
      reply: oneshot::Sender<Result<()>>,
   },
   Disconnect {
      reply: oneshot::Sender<()>,
   },
}

/// Starts the worker and notification delivery tasks for an open link.
pub(crate) fn spawn(
   link: Link,
   shared: Arc<Shared>,
   request_timeout: Duration,
) -> mpsc::Sender<Command> {
   let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
   let (deliveries, delivery_rx) = mpsc::unbounded_channel();

   tokio::spawn(deliver_notifications(shared.address, delivery_rx));

   let worker = Worker {
      mux: Multiplexer::new(shared.clone(), request_timeout),
      shared,
      link,
      commands: rx,
      deliveries,
   };
   tokio::spawn(worker.run());
   tx
}

async fn deliver_notifications(address: Address, mut rx: mpsc::UnboundedReceiver<Delivery>) {
   while let Some(Delivery {
      callback,
      handle,
      value,
   }) = rx.recv().await
   {
      callback(handle, &value);
   }
   debug!("{address}: Notification delivery stopped");
}

struct Worker {
   shared: Arc<Shared>,
   link: Link,
   commands: mpsc::Receiver<Command>,
   mux: Multiplexer,
   deliveries: mpsc::UnboundedSender<Delivery>,
}

impl Worker {
   async fn run(mut self) {
      let mut disconnect_reply = None;
      let reason = loop {
         let deadline = self.mux.deadline();
         tokio::select! {
            cmd = self.commands.recv() => match cmd {
               Some(Command::Disconnect { reply }) => {
                  disconnect_reply = Some(reply);
                  break CloseReason::Requested;
               },
               Some(cmd) => {
                  if let Err(reason) = self.handle_command(cmd).await {
                     break reason;
                  }
               },
               None => {
                  debug!("{}: All client handles dropped", self.shared.address);
                  break CloseReason::Requested;
               },
            },
            frame = self.link.recv() => match frame {
               Ok(frame) => {
                  if let Err(reason) = self.handle_frame(&frame).await {
                     break reason;
                  }
               },
               Err(e) => {
                  warn!("{}: Link lost: {e}", self.shared.address);
                  break CloseReason::LinkLost;
               },
            },
            () = time::sleep_until(deadline.unwrap_or_else(Instant::now)),
               if deadline.is_some() =>
            {
               break CloseReason::Timeout;
            },
         }
      };

      self.shutdown(reason);
      if let Some(reply) = disconnect_reply {
         let _ = reply.send(());
      }
   }

   /// Tears the session down. The intermediate state is published before any
   /// caller is resolved, so a caller woken here never sees the session as
   /// still usable.
   fn shutdown(&mut self, reason: CloseReason) {
      let interim = match reason.final_state() {
         SessionState::Error => SessionState::Error,
         _ => SessionState::Disconnecting,
      };
      self.shared.set_state(interim);
      debug!(
         "{}: Closing ({reason}) with {} request(s) outstanding",
         self.shared.address,
         self.mux.pending()
      );

      match reason {
         CloseReason::Timeout => {
            self.mux.expire();
            self.mux.cancel_all(None);
         },
         CloseReason::TransportFailure => self.mux.cancel_all(Some(Error::LinkClosed)),
         CloseReason::Requested | CloseReason::LinkLost => self.mux.cancel_all(None),
      }
      self.link.close();

      if reason.is_error() {
         self.shared.emit(SessionEvent::SessionError(reason.to_string().into()));
      }
      self.shared.close(reason);
   }

   async fn handle_command(&mut self, cmd: Command) -> std::result::Result<(), CloseReason> {
      match cmd {
         Command::Submit(job) => self.mux.submit(job),
         Command::Subscribe {
            handle,
            callback,
            job,
         } => {
            self.mux.subscribe(handle, callback);
            self.mux.submit(job);
         },
         Command::Unsubscribe { handle, job } => {
            if !self.mux.unsubscribe(handle) {
               debug!("{}: 0x{handle:04x} was not subscribed", self.shared.address);
            }
            self.mux.submit(job);
         },
         Command::WriteCommand {
            handle,
            value,
            reply,
         } => {
            let result = self.transmit(&Request::WriteCommand { handle, value }).await;
            let _ = reply.send(result.map_err(|reason| match reason {
               CloseReason::Timeout => Error::Timeout,
               _ => Error::LinkClosed,
            }));
            result?;
         },
         Command::Disconnect { reply } => {
            // handled by the run loop
            let _ = reply.send(());
         },
      }
      self.pump().await
   }

   async fn handle_frame(&mut self, frame: &[u8]) -> std::result::Result<(), CloseReason> {
      let message = match att::decode(frame) {
         Ok(message) => message,
         Err(att::FrameError::WrongDirection(_)) => return self.answer_server_request(frame).await,
         Err(att::FrameError::UnknownOpcode(id)) if id & att::COMMAND_FLAG == 0 => {
            debug!("{}: Rejecting unknown request 0x{id:02x}", self.shared.address);
            return self.reject_request(id).await;
         },
         Err(e) => {
            warn!(
               "{}: Dropping malformed frame {}: {e}",
               self.shared.address,
               hex::encode(frame)
            );
            return Ok(());
         },
      };

      let routed = self.mux.route(message);
      if routed.confirm {
         self.send_raw(&Request::HandleValueConfirmation.encode()).await?;
      }
      if let Some(delivery) = routed.deliver {
         let _ = self.deliveries.send(delivery);
      }
      if let Some(request) = routed.send {
         self.transmit(&request).await?;
      }
      self.pump().await
   }

   /// The peer may act as a client too. This side hosts no attributes, so
   /// only MTU exchange is honoured.
   async fn answer_server_request(&mut self, frame: &[u8]) -> std::result::Result<(), CloseReason> {
      let request = match Request::decode(frame) {
         Ok(request) => request,
         Err(e) => {
            warn!("{}: Dropping unexpected frame: {e}", self.shared.address);
            return Ok(());
         },
      };
      let Some(response) = request.expected_response() else {
         debug!("{}: Ignoring {}", self.shared.address, request.opcode());
         return Ok(());
      };

      if response != Opcode::ExchangeMtuResponse {
         return self.reject_request(request.opcode().id()).await;
      }
      let answer = DecodedMessage::Response(Response {
         opcode: response,
         handle: None,
         payload: self.shared.mtu().to_le_bytes().to_vec(),
      });
      self.send_raw(&answer.encode()).await
   }

   async fn reject_request(&self, request_opcode: u8) -> std::result::Result<(), CloseReason> {
      let answer = DecodedMessage::ErrorResponse(ErrorResponse {
         request_opcode,
         handle: 0x0000,
         code: AttErrorCode::RequestNotSupported,
      });
      self.send_raw(&answer.encode()).await
   }

   async fn pump(&mut self) -> std::result::Result<(), CloseReason> {
      if let Some(request) = self.mux.transmit_next() {
         self.transmit(&request).await?;
      }
      Ok(())
   }

   async fn transmit(&self, request: &Request) -> std::result::Result<(), CloseReason> {
      self.send_raw(&request.encode()).await
   }

   /// Sends one frame. A send still unacknowledged at the request deadline
   /// ends the session with a timeout, since nothing else is served meanwhile.
   async fn send_raw(&self, frame: &[u8]) -> std::result::Result<(), CloseReason> {
      match time::timeout_at(self.mux.send_deadline(), self.link.send(frame)).await {
         Ok(Ok(())) => Ok(()),
         Ok(Err(e)) => {
            warn!("{}: Send failed: {e}", self.shared.address);
            Err(CloseReason::TransportFailure)
         },
         Err(_) => {
            warn!("{}: Link did not take a frame in time", self.shared.address);
            Err(CloseReason::Timeout)
         },
      }
   }
}
