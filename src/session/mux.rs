//! Request multiplexer.
//!
//! ATT allows one outstanding request per bearer. Jobs queue here in
//! submission order; the head job's current request is the only one on the
//! wire. Inbound responses are matched to it by opcode, notifications and
//! indications by handle against the subscription table.

use std::{
   collections::{HashMap, VecDeque},
   sync::Arc,
   time::Duration,
};

use log::{debug, warn};
use tokio::{sync::oneshot, time::Instant};

use crate::{
   att::{DecodedMessage, ErrorResponse, HandleValue, Opcode, Request, Response},
   error::{Error, Result},
   session::{
      SessionState, Shared,
      procedure::{Outcome, Procedure, Step},
   },
};

/// Callback invoked with `(handle, value)` for each update.
pub type NotificationCallback = Arc<dyn Fn(u16, &[u8]) + Send + Sync>;

/// A queued procedure and its caller.
pub(crate) struct Job {
   pub procedure: Procedure,
   pub reply: oneshot::Sender<Result<Outcome>>,
}

impl Job {
   pub fn new(procedure: Procedure) -> (Self, oneshot::Receiver<Result<Outcome>>) {
      let (reply, rx) = oneshot::channel();
      (Self { procedure, reply }, rx)
   }
}

struct InFlight {
   job: Job,
   request: Opcode,
   expected: Opcode,
   deadline: Instant,
}

/// A value update headed for a subscriber.
pub(crate) struct Delivery {
   pub callback: NotificationCallback,
   pub handle: u16,
   pub value: Vec<u8>,
}

/// What the worker must do after routing an inbound message.
#[derive(Default)]
pub(crate) struct Routed {
   /// Next request to put on the wire.
   pub send: Option<Request>,
   pub deliver: Option<Delivery>,
   /// The message was an indication and must be confirmed.
   pub confirm: bool,
}

pub(crate) struct Multiplexer {
   shared: Arc<Shared>,
   timeout: Duration,
   queue: VecDeque<Job>,
   in_flight: Option<InFlight>,
   subscriptions: HashMap<u16, NotificationCallback>,
   /// State to restore if service discovery fails.
   resume_state: SessionState,
}

impl Multiplexer {
   pub fn new(shared: Arc<Shared>, timeout: Duration) -> Self {
      Self {
         shared,
         timeout,
         queue: VecDeque::new(),
         in_flight: None,
         subscriptions: HashMap::new(),
         resume_state: SessionState::Connected,
      }
   }

   pub fn submit(&mut self, job: Job) {
      self.queue.push_back(job);
   }

   /// Jobs waiting or in flight.
   pub fn pending(&self) -> usize {
      self.queue.len() + usize::from(self.in_flight.is_some())
   }

   pub fn deadline(&self) -> Option<Instant> {
      self.in_flight.as_ref().map(|f| f.deadline)
   }

   /// Latest instant a frame sent now may take to reach the link: the
   /// in-flight deadline, or a full request timeout when idle.
   pub fn send_deadline(&self) -> Instant {
      self.deadline().unwrap_or_else(|| Instant::now() + self.timeout)
   }

   pub fn subscribe(&mut self, handle: u16, callback: NotificationCallback) {
      if self.subscriptions.insert(handle, callback).is_some() {
         debug!("Replaced subscription on 0x{handle:04x}");
      }
   }

   pub fn unsubscribe(&mut self, handle: u16) -> bool {
      self.subscriptions.remove(&handle).is_some()
   }

   #[cfg(test)]
   pub fn is_subscribed(&self, handle: u16) -> bool {
      self.subscriptions.contains_key(&handle)
   }

   /// Starts queued jobs until one puts a request on the wire.
   pub fn transmit_next(&mut self) -> Option<Request> {
      if self.in_flight.is_some() {
         return None;
      }
      while let Some(mut job) = self.queue.pop_front() {
         let state = self.shared.state();
         if job.procedure.needs_ready() && state != SessionState::Ready {
            debug!("Dropping queued job, session is {state}");
            self.complete(job, Err(Error::NotConnected));
            continue;
         }
         if job.procedure.is_service_discovery() {
            self.resume_state = state;
            self.shared.set_state(SessionState::Discovering);
         }
         job.procedure.set_mtu(self.shared.mtu());

         match job.procedure.start() {
            Step::Send(request) => {
               self.track(job, &request);
               return Some(request);
            },
            Step::Done(result) => self.complete(job, result),
         }
      }
      None
   }

   pub fn route(&mut self, message: DecodedMessage) -> Routed {
      match message {
         DecodedMessage::Response(response) => Routed {
            send: self.on_response(response),
            ..Default::default()
         },
         DecodedMessage::ErrorResponse(err) => Routed {
            send: self.on_error(err),
            ..Default::default()
         },
         DecodedMessage::Notification(hv) => Routed {
            deliver: self.delivery(hv),
            ..Default::default()
         },
         DecodedMessage::Indication(hv) => Routed {
            send: None,
            deliver: self.delivery(hv),
            confirm: true,
         },
      }
   }

   /// Fails the in-flight request with a timeout. The session is done after
   /// this; the caller follows up with [`Self::cancel_all`].
   pub fn expire(&mut self) {
      if let Some(flight) = self.in_flight.take() {
         warn!("{}: No response to {} in time", self.shared.address, flight.request);
         let _ = flight.job.reply.send(Err(Error::Timeout));
      }
   }

   /// Resolves every outstanding caller. The in-flight one gets `in_flight`
   /// (if given), everything else `Cancelled`. Subscriptions are dropped.
   pub fn cancel_all(&mut self, in_flight: Option<Error>) {
      let mut cancelled = 0;
      if let Some(flight) = self.in_flight.take() {
         let _ = flight.job.reply.send(Err(in_flight.unwrap_or(Error::Cancelled)));
         cancelled += 1;
      }
      for job in self.queue.drain(..) {
         let _ = job.reply.send(Err(Error::Cancelled));
         cancelled += 1;
      }
      self.subscriptions.clear();
      if cancelled > 0 {
         debug!("{}: Resolved {cancelled} outstanding request(s)", self.shared.address);
      }
   }

   fn on_response(&mut self, response: Response) -> Option<Request> {
      let Some(flight) = self.in_flight.take_if(|f| f.expected == response.opcode) else {
         warn!(
            "{}: Dropping unmatched {} (handle {:?})",
            self.shared.address, response.opcode, response.handle
         );
         return None;
      };
      let mut job = flight.job;
      match job.procedure.on_response(response) {
         Step::Send(request) => {
            self.track(job, &request);
            Some(request)
         },
         Step::Done(result) => {
            self.complete(job, result);
            self.transmit_next()
         },
      }
   }

   fn on_error(&mut self, err: ErrorResponse) -> Option<Request> {
      let Some(flight) = self.in_flight.take_if(|f| f.request.id() == err.request_opcode) else {
         warn!(
            "{}: Dropping unmatched error {} for opcode 0x{:02x}",
            self.shared.address, err.code, err.request_opcode
         );
         return None;
      };
      let request = flight.request;
      let mut job = flight.job;
      match job.procedure.on_error(err, request) {
         Step::Send(request) => {
            self.track(job, &request);
            Some(request)
         },
         Step::Done(result) => {
            self.complete(job, result);
            self.transmit_next()
         },
      }
   }

   fn delivery(&self, hv: HandleValue) -> Option<Delivery> {
      let Some(callback) = self.subscriptions.get(&hv.handle) else {
         debug!("{}: No subscriber for 0x{:04x}", self.shared.address, hv.handle);
         return None;
      };
      Some(Delivery {
         callback: callback.clone(),
         handle: hv.handle,
         value: hv.value,
      })
   }

   fn track(&mut self, job: Job, request: &Request) {
      let opcode = request.opcode();
      let Some(expected) = request.expected_response() else {
         let _ = job.reply.send(Err(Error::InvalidArgument(format!(
            "{opcode} expects no response"
         ))));
         return;
      };
      self.in_flight = Some(InFlight {
         job,
         request: opcode,
         expected,
         deadline: Instant::now() + self.timeout,
      });
   }

   fn complete(&mut self, job: Job, result: Result<Outcome>) {
      let procedure = &job.procedure;
      match &result {
         Ok(Outcome::Services(services)) => {
            self.shared.cache.write().set_services(services.clone());
         },
         Ok(Outcome::Characteristics(chars)) => {
            self.shared.cache.write().insert_characteristics(chars);
         },
         Ok(Outcome::Descriptors(descriptors)) => {
            self.shared.cache.write().insert_descriptors(descriptors);
         },
         Ok(Outcome::Mtu(mtu)) => self.shared.set_mtu(*mtu),
         _ => {},
      }

      if procedure.is_service_discovery() {
         let next = if result.is_ok() {
            SessionState::Ready
         } else {
            self.resume_state
         };
         self.shared.set_state(next);
      }
      if let Some(handle) = procedure.enables_subscription()
         && result.is_err()
      {
         self.subscriptions.remove(&handle);
         debug!("{}: Subscription to 0x{handle:04x} rolled back", self.shared.address);
      }

      let _ = job.reply.send(result);
   }
}
