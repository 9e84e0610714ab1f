//! Multi-step GATT procedures.
//!
//! A procedure is a small state machine that emits one request at a time
//! and consumes the matching response. The multiplexer keeps it at the head
//! of the queue until it yields [`Step::Done`].

use log::{debug, warn};

use crate::{
   att::{AttErrorCode, AttUuid, DEFAULT_MTU, ErrorResponse, Opcode, Request, Response},
   error::{Error, Result},
   gatt::{Characteristic, Descriptor, Service, parser},
};

/// Largest attribute value a long read will assemble.
const MAX_ATTRIBUTE_LEN: usize = 512;

/// Result of a finished procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
   Value(Vec<u8>),
   HandleValues(Vec<(u16, Vec<u8>)>),
   Services(Vec<Service>),
   Characteristics(Vec<Characteristic>),
   Descriptors(Vec<Descriptor>),
   Mtu(u16),
   Written,
}

#[derive(Debug)]
pub(crate) enum Step {
   Send(Request),
   Done(Result<Outcome>),
}

/// Cursor of a paginated search; `None` once the range is exhausted.
type Cursor = Option<u16>;

#[derive(Debug)]
pub(crate) enum Procedure {
   ExchangeMtu {
      client_mtu: u16,
   },
   Write {
      handle: u16,
      value: Vec<u8>,
   },
   /// Read followed by Read Blob while chunks fill `mtu - 1` bytes.
   ReadLong {
      handle: u16,
      mtu: u16,
      value: Vec<u8>,
   },
   ReadByUuid {
      next: Cursor,
      end: u16,
      uuid: AttUuid,
      found: Vec<(u16, Vec<u8>)>,
   },
   DiscoverServices {
      next: Cursor,
      found: Vec<Service>,
   },
   DiscoverCharacteristics {
      service: Service,
      next: Cursor,
      found: Vec<Characteristic>,
   },
   DiscoverDescriptors {
      next: Cursor,
      end: u16,
      found: Vec<Descriptor>,
   },
   /// Writes a Client Characteristic Configuration descriptor.
   ConfigureCccd {
      value_handle: u16,
      cccd: u16,
      value: u16,
   },
}

impl Procedure {
   pub const fn discover_services() -> Self {
      Self::DiscoverServices {
         next: Some(0x0001),
         found: Vec::new(),
      }
   }

   pub const fn discover_characteristics(service: Service) -> Self {
      Self::DiscoverCharacteristics {
         service,
         next: Some(service.start_handle),
         found: Vec::new(),
      }
   }

   pub fn discover_descriptors(characteristic: &Characteristic) -> Self {
      Self::DiscoverDescriptors {
         next: characteristic.value_handle.checked_add(1),
         end: characteristic.end_handle,
         found: Vec::new(),
      }
   }

   pub const fn read(handle: u16, mtu: u16) -> Self {
      Self::ReadLong {
         handle,
         mtu,
         value: Vec::new(),
      }
   }

   pub const fn read_by_uuid(start: u16, end: u16, uuid: AttUuid) -> Self {
      Self::ReadByUuid {
         next: Some(start),
         end,
         uuid,
         found: Vec::new(),
      }
   }

   /// Whether the procedure may only start once discovery has completed.
   pub const fn needs_ready(&self) -> bool {
      !matches!(self, Self::ExchangeMtu { .. } | Self::DiscoverServices { .. })
   }

   /// Long reads size their blobs by the MTU in force when they start.
   pub fn set_mtu(&mut self, current: u16) {
      if let Self::ReadLong { mtu, .. } = self {
         *mtu = current;
      }
   }

   pub const fn is_service_discovery(&self) -> bool {
      matches!(self, Self::DiscoverServices { .. })
   }

   /// Handle whose subscription depends on this procedure succeeding.
   pub const fn enables_subscription(&self) -> Option<u16> {
      match self {
         Self::ConfigureCccd {
            value_handle,
            value,
            ..
         } if *value != 0 => Some(*value_handle),
         _ => None,
      }
   }

   pub fn start(&mut self) -> Step {
      match self {
         Self::ExchangeMtu { client_mtu } => Step::Send(Request::ExchangeMtu { mtu: *client_mtu }),
         Self::Write { handle, value } => Step::Send(Request::Write {
            handle: *handle,
            value: std::mem::take(value),
         }),
         Self::ReadLong { handle, .. } => Step::Send(Request::Read { handle: *handle }),
         Self::ConfigureCccd { cccd, value, .. } => Step::Send(Request::Write {
            handle: *cccd,
            value: value.to_le_bytes().to_vec(),
         }),
         Self::ReadByUuid { .. }
         | Self::DiscoverServices { .. }
         | Self::DiscoverCharacteristics { .. }
         | Self::DiscoverDescriptors { .. } => self.next_page(),
      }
   }

   pub fn on_response(&mut self, response: Response) -> Step {
      let payload = response.payload.as_slice();
      let paged = match self {
         Self::ExchangeMtu { client_mtu } => {
            return match parser::parse_mtu(payload) {
               Ok(server_mtu) => {
                  if server_mtu < DEFAULT_MTU {
                     warn!("Peer reported MTU {server_mtu}, below the LE minimum {DEFAULT_MTU}");
                  }
                  let mtu = server_mtu.max(DEFAULT_MTU).min(*client_mtu);
                  Step::Done(Ok(Outcome::Mtu(mtu)))
               },
               Err(e) => Step::Done(Err(e.into())),
            };
         },
         Self::Write { .. } | Self::ConfigureCccd { .. } => {
            return Step::Done(Ok(Outcome::Written));
         },
         Self::ReadLong { handle, mtu, value } => {
            value.extend_from_slice(payload);
            let full_chunk = usize::from(*mtu).saturating_sub(1);
            if payload.len() < full_chunk || value.len() >= MAX_ATTRIBUTE_LEN {
               return Step::Done(Ok(Outcome::Value(std::mem::take(value))));
            }
            debug!("Long read of 0x{handle:04x}, {} bytes so far", value.len());
            return Step::Send(Request::ReadBlob {
               handle: *handle,
               offset: u16::try_from(value.len()).unwrap_or(u16::MAX),
            });
         },
         Self::ReadByUuid { next, end, found, .. } => {
            parser::parse_handle_values(payload).map(|page| {
               advance(next, page.last().map(|(h, _)| *h), *end);
               found.extend(page);
            })
         },
         Self::DiscoverServices { next, found } => parser::parse_services(payload).map(|page| {
            advance(next, page.last().map(|s| s.end_handle), 0xFFFF);
            found.extend(page);
         }),
         Self::DiscoverCharacteristics { service, next, found } => {
            parser::parse_characteristics(payload).map(|page| {
               advance(next, page.last().map(|c| c.declaration_handle), service.end_handle);
               found.extend(page);
            })
         },
         Self::DiscoverDescriptors { next, end, found } => {
            parser::parse_descriptors(payload).map(|page| {
               advance(next, page.last().map(|d| d.handle), *end);
               found.extend(page);
            })
         },
      };
      match paged {
         Ok(()) => self.next_page(),
         Err(e) => Step::Done(Err(e.into())),
      }
   }

   /// Handles an Error Response to the current request.
   ///
   /// Attribute Not Found ends a paginated search normally; long reads stop
   /// at the first blob the server refuses to split.
   pub fn on_error(&mut self, err: ErrorResponse, request: Opcode) -> Step {
      let code = err.code;
      let paged_end = code == AttErrorCode::AttributeNotFound
         && match self {
            Self::DiscoverServices { .. }
            | Self::DiscoverCharacteristics { .. }
            | Self::DiscoverDescriptors { .. } => true,
            Self::ReadByUuid { found, .. } => !found.is_empty(),
            _ => false,
         };
      if paged_end {
         return self.finish();
      }

      if let Self::ReadLong { value, .. } = self
         && request == Opcode::ReadBlobRequest
         && matches!(code, AttErrorCode::AttributeNotLong | AttErrorCode::InvalidOffset)
      {
         return Step::Done(Ok(Outcome::Value(std::mem::take(value))));
      }

      Step::Done(Err(Error::Protocol {
         request,
         handle: err.handle,
         code,
      }))
   }

   /// Request for the next page, or the collected result once the range is
   /// exhausted.
   fn next_page(&mut self) -> Step {
      let request = match self {
         Self::ReadByUuid {
            next: Some(start),
            end,
            uuid,
            ..
         } if *start <= *end => Request::ReadByType {
            start: *start,
            end: *end,
            attribute_type: *uuid,
         },
         Self::DiscoverServices {
            next: Some(start), ..
         } => Request::ReadByGroupType {
            start: *start,
            end: 0xFFFF,
            group_type: AttUuid::PRIMARY_SERVICE,
         },
         Self::DiscoverCharacteristics {
            service,
            next: Some(start),
            ..
         } if *start <= service.end_handle => Request::ReadByType {
            start: *start,
            end: service.end_handle,
            attribute_type: AttUuid::CHARACTERISTIC,
         },
         Self::DiscoverDescriptors {
            next: Some(start),
            end,
            ..
         } if *start <= *end => Request::FindInformation {
            start: *start,
            end: *end,
         },
         _ => return self.finish(),
      };
      Step::Send(request)
   }

   fn finish(&mut self) -> Step {
      let outcome = match self {
         Self::ReadByUuid { found, .. } => Outcome::HandleValues(std::mem::take(found)),
         Self::DiscoverServices { found, .. } => Outcome::Services(std::mem::take(found)),
         Self::DiscoverCharacteristics { service, found, .. } => {
            let mut found = std::mem::take(found);
            parser::close_characteristic_ranges(&mut found, service.end_handle);
            Outcome::Characteristics(found)
         },
         Self::DiscoverDescriptors { found, .. } => Outcome::Descriptors(std::mem::take(found)),
         Self::ReadLong { value, .. } => Outcome::Value(std::mem::take(value)),
         Self::ExchangeMtu { client_mtu } => Outcome::Mtu(*client_mtu),
         Self::Write { .. } | Self::ConfigureCccd { .. } => Outcome::Written,
      };
      Step::Done(Ok(outcome))
   }
}

/// Moves the cursor past the last handle of a page. The search ends at the
/// range end, on an empty page, or when the server stops making progress.
fn advance(next: &mut Cursor, last: Option<u16>, end: u16) {
   let Some(start) = *next else {
      return;
   };
   *next = match last {
      Some(last) if last < start => {
         warn!("Server went backwards to 0x{last:04x} from 0x{start:04x}, ending search");
         None
      },
      Some(last) if last < end => Some(last + 1),
      _ => None,
   };
}
