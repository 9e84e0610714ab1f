//! Simulated GATT server for session tests.
//!
//! Serves a flat attribute table over a [`MemoryPeer`], answering one
//! attribute per discovery response so pagination is exercised.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
   att::{
      AttErrorCode, AttUuid, DecodedMessage, ErrorResponse, HandleValue, Opcode, Request,
      Response,
   },
   gatt::Properties,
   transport::memory::MemoryPeer,
};

#[derive(Debug, Clone)]
struct Attribute {
   handle: u16,
   uuid: AttUuid,
   value: Vec<u8>,
   /// Group end for service declarations.
   group_end: u16,
}

/// Recorded traffic, shared with the test.
#[derive(Debug, Default)]
pub(crate) struct Record {
   pub requests: Vec<Request>,
   pub confirmations: usize,
}

pub(crate) enum Control {
   Notify(u16, Vec<u8>),
   Indicate(u16, Vec<u8>),
   /// Stop answering requests.
   GoSilent,
   Disconnect,
}

pub(crate) struct SimPeripheral {
   attributes: Vec<Attribute>,
   mtu: u16,
   silent: bool,
}

/// Test-side handle to a running simulator.
pub(crate) struct SimHandle {
   control: mpsc::UnboundedSender<Control>,
   pub record: Arc<Mutex<Record>>,
}

impl SimHandle {
   pub fn notify(&self, handle: u16, value: &[u8]) {
      let _ = self.control.send(Control::Notify(handle, value.to_vec()));
   }

   pub fn indicate(&self, handle: u16, value: &[u8]) {
      let _ = self.control.send(Control::Indicate(handle, value.to_vec()));
   }

   pub fn go_silent(&self) {
      let _ = self.control.send(Control::GoSilent);
   }

   pub fn disconnect(&self) {
      let _ = self.control.send(Control::Disconnect);
   }

   pub fn requests(&self) -> Vec<Request> {
      self.record.lock().requests.clone()
   }
}

impl SimPeripheral {
   pub const fn new() -> Self {
      Self {
         attributes: Vec::new(),
         mtu: 23,
         silent: false,
      }
   }

   /// Generic Access service at 0x000E..=0x0011 with the Device Name
   /// characteristic: declaration 0x000F, value 0x0010, CCCD 0x0011.
   pub fn device_name(name: &str) -> Self {
      let mut sim = Self::new();
      sim.add_service(0x000E, 0x0011, AttUuid::Uuid16(0x1800));
      sim.add_characteristic(
         0x000F,
         Properties::READ | Properties::WRITE | Properties::NOTIFY,
         AttUuid::Uuid16(0x2A00),
         name.as_bytes(),
      );
      sim.add_descriptor(0x0011, AttUuid::CLIENT_CHARACTERISTIC_CONFIGURATION, &[0, 0]);
      sim
   }

   pub fn add_service(&mut self, start: u16, end: u16, uuid: AttUuid) -> &mut Self {
      self.attributes.push(Attribute {
         handle: start,
         uuid: AttUuid::PRIMARY_SERVICE,
         value: uuid.to_le_bytes().to_vec(),
         group_end: end,
      });
      self.sort();
      self
   }

   /// Declaration at `handle`, value at `handle + 1`.
   pub fn add_characteristic(
      &mut self,
      handle: u16,
      properties: Properties,
      uuid: AttUuid,
      value: &[u8],
   ) -> &mut Self {
      let mut decl = vec![properties.0];
      decl.extend_from_slice(&(handle + 1).to_le_bytes());
      decl.extend_from_slice(&uuid.to_le_bytes());
      self.attributes.push(Attribute {
         handle,
         uuid: AttUuid::CHARACTERISTIC,
         value: decl,
         group_end: handle,
      });
      self.attributes.push(Attribute {
         handle: handle + 1,
         uuid,
         value: value.to_vec(),
         group_end: handle + 1,
      });
      self.sort();
      self
   }

   pub fn add_descriptor(&mut self, handle: u16, uuid: AttUuid, value: &[u8]) -> &mut Self {
      self.attributes.push(Attribute {
         handle,
         uuid,
         value: value.to_vec(),
         group_end: handle,
      });
      self.sort();
      self
   }

   pub fn spawn(self, peer: MemoryPeer) -> SimHandle {
      let (control, control_rx) = mpsc::unbounded_channel();
      let record = Arc::new(Mutex::new(Record::default()));
      tokio::spawn(self.run(peer, control_rx, record.clone()));
      SimHandle { control, record }
   }

   fn sort(&mut self) {
      self.attributes.sort_by_key(|a| a.handle);
   }

   async fn run(
      mut self,
      mut peer: MemoryPeer,
      mut control: mpsc::UnboundedReceiver<Control>,
      record: Arc<Mutex<Record>>,
   ) {
      loop {
         tokio::select! {
            frame = peer.recv() => {
               let Some(frame) = frame else {
                  return;
               };
               let Ok(request) = Request::decode(&frame) else {
                  continue;
               };
               if request == Request::HandleValueConfirmation {
                  record.lock().confirmations += 1;
                  continue;
               }
               record.lock().requests.push(request.clone());
               if self.silent {
                  continue;
               }
               if let Some(answer) = self.answer(&request) {
                  peer.send(&answer.encode()).await;
               }
            },
            Some(ctl) = control.recv() => match ctl {
               Control::Notify(handle, value) => {
                  let msg = DecodedMessage::Notification(HandleValue { handle, value });
                  peer.send(&msg.encode()).await;
               },
               Control::Indicate(handle, value) => {
                  let msg = DecodedMessage::Indication(HandleValue { handle, value });
                  peer.send(&msg.encode()).await;
               },
               Control::GoSilent => self.silent = true,
               Control::Disconnect => {
                  peer.disconnect().await;
                  return;
               },
            },
         }
      }
   }

   fn answer(&mut self, request: &Request) -> Option<DecodedMessage> {
      let opcode = request.opcode();
      let response = |payload: Vec<u8>| {
         DecodedMessage::Response(Response {
            opcode: opcode.response().unwrap_or(Opcode::ErrorResponse),
            handle: None,
            payload,
         })
      };
      let error = |handle: u16, code: AttErrorCode| {
         DecodedMessage::ErrorResponse(ErrorResponse {
            request_opcode: opcode.id(),
            handle,
            code,
         })
      };

      let answer = match request {
         Request::ExchangeMtu { .. } => response(self.mtu.to_le_bytes().to_vec()),
         Request::ReadByGroupType { start, end, group_type } => {
            match self.first_in(*start, *end, *group_type) {
               Some(attr) => {
                  let mut entry = vec![(4 + attr.value.len()) as u8];
                  entry.extend_from_slice(&attr.handle.to_le_bytes());
                  entry.extend_from_slice(&attr.group_end.to_le_bytes());
                  entry.extend_from_slice(&attr.value);
                  response(entry)
               },
               None => error(*start, AttErrorCode::AttributeNotFound),
            }
         },
         Request::ReadByType {
            start,
            end,
            attribute_type,
         } => match self.first_in(*start, *end, *attribute_type) {
            Some(attr) => {
               let mut entry = vec![(2 + attr.value.len()) as u8];
               entry.extend_from_slice(&attr.handle.to_le_bytes());
               entry.extend_from_slice(&attr.value);
               response(entry)
            },
            None => error(*start, AttErrorCode::AttributeNotFound),
         },
         Request::FindInformation { start, end } => {
            match self.attributes.iter().find(|a| (*start..=*end).contains(&a.handle)) {
               Some(attr) => {
                  let format = if attr.uuid.as_u16().is_some() { 0x01 } else { 0x02 };
                  let mut entry = vec![format];
                  entry.extend_from_slice(&attr.handle.to_le_bytes());
                  match attr.uuid.as_u16() {
                     Some(short) => entry.extend_from_slice(&short.to_le_bytes()),
                     None => entry.extend_from_slice(&attr.uuid.as_u128().to_le_bytes()),
                  }
                  response(entry)
               },
               None => error(*start, AttErrorCode::AttributeNotFound),
            }
         },
         Request::Read { handle } => match self.attribute(*handle) {
            Some(attr) => {
               let chunk = usize::from(self.mtu - 1).min(attr.value.len());
               response(attr.value[..chunk].to_vec())
            },
            None => error(*handle, AttErrorCode::InvalidHandle),
         },
         Request::ReadBlob { handle, offset } => {
            let mtu = usize::from(self.mtu);
            match self.attribute(*handle) {
               Some(attr) if usize::from(*offset) > attr.value.len() => {
                  error(*handle, AttErrorCode::InvalidOffset)
               },
               Some(attr) => {
                  let from = usize::from(*offset);
                  let to = (from + mtu - 1).min(attr.value.len());
                  response(attr.value[from..to].to_vec())
               },
               None => error(*handle, AttErrorCode::InvalidHandle),
            }
         },
         Request::Write { handle, value } => match self.attribute_mut(*handle) {
            Some(attr) => {
               attr.value.clone_from(value);
               response(Vec::new())
            },
            None => error(*handle, AttErrorCode::InvalidHandle),
         },
         Request::WriteCommand { handle, value } => {
            if let Some(attr) = self.attribute_mut(*handle) {
               attr.value.clone_from(value);
            }
            return None;
         },
         _ => error(0x0000, AttErrorCode::RequestNotSupported),
      };
      Some(answer)
   }

   fn first_in(&self, start: u16, end: u16, uuid: AttUuid) -> Option<&Attribute> {
      self
         .attributes
         .iter()
         .find(|a| (start..=end).contains(&a.handle) && a.uuid == uuid)
   }

   fn attribute(&self, handle: u16) -> Option<&Attribute> {
      self.attributes.iter().find(|a| a.handle == handle)
   }

   fn attribute_mut(&mut self, handle: u16) -> Option<&mut Attribute> {
      self.attributes.iter_mut().find(|a| a.handle == handle)
   }
}
