//! ATT PDU layouts.
//!
//! Client requests are modelled by [`Request`]; everything a server sends is
//! classified by [`decode`] into a [`DecodedMessage`]. Both sides encode and
//! decode so a simulated server can reuse the exact same layouts.

use crate::{
   att::{AttErrorCode, AttUuid, FrameError, Opcode},
   transport::Frame,
};

/// A PDU sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
   ExchangeMtu {
      mtu: u16,
   },
   FindInformation {
      start: u16,
      end: u16,
   },
   FindByTypeValue {
      start: u16,
      end: u16,
      attribute_type: u16,
      value: Vec<u8>,
   },
   ReadByType {
      start: u16,
      end: u16,
      attribute_type: AttUuid,
   },
   Read {
      handle: u16,
   },
   ReadBlob {
      handle: u16,
      offset: u16,
   },
   ReadMultiple {
      handles: Vec<u16>,
   },
   ReadByGroupType {
      start: u16,
      end: u16,
      group_type: AttUuid,
   },
   Write {
      handle: u16,
      value: Vec<u8>,
   },
   WriteCommand {
      handle: u16,
      value: Vec<u8>,
   },
   PrepareWrite {
      handle: u16,
      offset: u16,
      value: Vec<u8>,
   },
   ExecuteWrite {
      commit: bool,
   },
   HandleValueConfirmation,
}

impl Request {
   pub const fn opcode(&self) -> Opcode {
      match self {
         Self::ExchangeMtu { .. } => Opcode::ExchangeMtuRequest,
         Self::FindInformation { .. } => Opcode::FindInformationRequest,
         Self::FindByTypeValue { .. } => Opcode::FindByTypeValueRequest,
         Self::ReadByType { .. } => Opcode::ReadByTypeRequest,
         Self::Read { .. } => Opcode::ReadRequest,
         Self::ReadBlob { .. } => Opcode::ReadBlobRequest,
         Self::ReadMultiple { .. } => Opcode::ReadMultipleRequest,
         Self::ReadByGroupType { .. } => Opcode::ReadByGroupTypeRequest,
         Self::Write { .. } => Opcode::WriteRequest,
         Self::WriteCommand { .. } => Opcode::WriteCommand,
         Self::PrepareWrite { .. } => Opcode::PrepareWriteRequest,
         Self::ExecuteWrite { .. } => Opcode::ExecuteWriteRequest,
         Self::HandleValueConfirmation => Opcode::HandleValueConfirmation,
      }
   }

   /// Response opcode this request waits for, `None` for commands.
   pub const fn expected_response(&self) -> Option<Opcode> {
      self.opcode().response()
   }

   pub fn encode(&self) -> Frame {
      let mut out = Frame::new();
      out.push(self.opcode().id());
      match self {
         Self::ExchangeMtu { mtu } => put_u16(&mut out, *mtu),
         Self::FindInformation { start, end } => {
            put_u16(&mut out, *start);
            put_u16(&mut out, *end);
         },
         Self::FindByTypeValue {
            start,
            end,
            attribute_type,
            value,
         } => {
            put_u16(&mut out, *start);
            put_u16(&mut out, *end);
            put_u16(&mut out, *attribute_type);
            out.extend_from_slice(value);
         },
         Self::ReadByType {
            start,
            end,
            attribute_type: uuid,
         }
         | Self::ReadByGroupType {
            start,
            end,
            group_type: uuid,
         } => {
            put_u16(&mut out, *start);
            put_u16(&mut out, *end);
            out.extend_from_slice(&uuid.to_le_bytes());
         },
         Self::Read { handle } => put_u16(&mut out, *handle),
         Self::ReadBlob { handle, offset } => {
            put_u16(&mut out, *handle);
            put_u16(&mut out, *offset);
         },
         Self::ReadMultiple { handles } => {
            for handle in handles {
               put_u16(&mut out, *handle);
            }
         },
         Self::Write { handle, value } | Self::WriteCommand { handle, value } => {
            put_u16(&mut out, *handle);
            out.extend_from_slice(value);
         },
         Self::PrepareWrite {
            handle,
            offset,
            value,
         } => {
            put_u16(&mut out, *handle);
            put_u16(&mut out, *offset);
            out.extend_from_slice(value);
         },
         Self::ExecuteWrite { commit } => out.push(u8::from(*commit)),
         Self::HandleValueConfirmation => {},
      }
      out
   }

   /// Parses a client PDU, as a server would.
   pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
      let opcode = opcode_of(data)?;
      let request = match opcode {
         Opcode::ExchangeMtuRequest => {
            exact(opcode, data, 3)?;
            Self::ExchangeMtu {
               mtu: le16(data, 1),
            }
         },
         Opcode::FindInformationRequest => {
            exact(opcode, data, 5)?;
            Self::FindInformation {
               start: le16(data, 1),
               end: le16(data, 3),
            }
         },
         Opcode::FindByTypeValueRequest => {
            at_least(opcode, data, 7)?;
            Self::FindByTypeValue {
               start: le16(data, 1),
               end: le16(data, 3),
               attribute_type: le16(data, 5),
               value: data[7..].to_vec(),
            }
         },
         Opcode::ReadByTypeRequest => {
            at_least(opcode, data, 7)?;
            Self::ReadByType {
               start: le16(data, 1),
               end: le16(data, 3),
               attribute_type: AttUuid::from_le_slice(&data[5..])?,
            }
         },
         Opcode::ReadByGroupTypeRequest => {
            at_least(opcode, data, 7)?;
            Self::ReadByGroupType {
               start: le16(data, 1),
               end: le16(data, 3),
               group_type: AttUuid::from_le_slice(&data[5..])?,
            }
         },
         Opcode::ReadRequest => {
            exact(opcode, data, 3)?;
            Self::Read {
               handle: le16(data, 1),
            }
         },
         Opcode::ReadBlobRequest => {
            exact(opcode, data, 5)?;
            Self::ReadBlob {
               handle: le16(data, 1),
               offset: le16(data, 3),
            }
         },
         Opcode::ReadMultipleRequest => {
            at_least(opcode, data, 5)?;
            if (data.len() - 1) % 2 != 0 {
               return Err(FrameError::InvalidFormat {
                  opcode,
                  reason: "odd handle list",
               });
            }
            Self::ReadMultiple {
               handles: data[1..]
                  .chunks_exact(2)
                  .map(|c| u16::from_le_bytes([c[0], c[1]]))
                  .collect(),
            }
         },
         Opcode::WriteRequest => {
            at_least(opcode, data, 3)?;
            Self::Write {
               handle: le16(data, 1),
               value: data[3..].to_vec(),
            }
         },
         Opcode::WriteCommand => {
            at_least(opcode, data, 3)?;
            Self::WriteCommand {
               handle: le16(data, 1),
               value: data[3..].to_vec(),
            }
         },
         Opcode::PrepareWriteRequest => {
            at_least(opcode, data, 5)?;
            Self::PrepareWrite {
               handle: le16(data, 1),
               offset: le16(data, 3),
               value: data[5..].to_vec(),
            }
         },
         Opcode::ExecuteWriteRequest => {
            exact(opcode, data, 2)?;
            match data[1] {
               0x00 => Self::ExecuteWrite { commit: false },
               0x01 => Self::ExecuteWrite { commit: true },
               _ => {
                  return Err(FrameError::InvalidFormat {
                     opcode,
                     reason: "flags must be 0x00 or 0x01",
                  });
               },
            }
         },
         Opcode::HandleValueConfirmation => {
            exact(opcode, data, 1)?;
            Self::HandleValueConfirmation
         },
         other => return Err(FrameError::WrongDirection(other)),
      };
      Ok(request)
   }
}

/// A successful server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
   pub opcode: Opcode,
   /// Only Prepare Write responses echo a handle.
   pub handle: Option<u16>,
   pub payload: Vec<u8>,
}

/// An ATT Error Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResponse {
   /// Raw opcode of the request that failed.
   pub request_opcode: u8,
   pub handle: u16,
   pub code: AttErrorCode,
}

/// Payload of a notification or indication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValue {
   pub handle: u16,
   pub value: Vec<u8>,
}

/// Classified server PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedMessage {
   Response(Response),
   ErrorResponse(ErrorResponse),
   Notification(HandleValue),
   Indication(HandleValue),
}

impl DecodedMessage {
   pub const fn opcode(&self) -> Opcode {
      match self {
         Self::Response(r) => r.opcode,
         Self::ErrorResponse(_) => Opcode::ErrorResponse,
         Self::Notification(_) => Opcode::HandleValueNotification,
         Self::Indication(_) => Opcode::HandleValueIndication,
      }
   }

   pub const fn handle(&self) -> Option<u16> {
      match self {
         Self::Response(r) => r.handle,
         Self::ErrorResponse(e) => Some(e.handle),
         Self::Notification(hv) | Self::Indication(hv) => Some(hv.handle),
      }
   }

   pub fn payload(&self) -> &[u8] {
      match self {
         Self::Response(r) => &r.payload,
         Self::ErrorResponse(_) => &[],
         Self::Notification(hv) | Self::Indication(hv) => &hv.value,
      }
   }

   /// Server-side encoding, the inverse of [`decode`].
   pub fn encode(&self) -> Frame {
      let mut out = Frame::new();
      out.push(self.opcode().id());
      match self {
         Self::Response(r) => {
            if let Some(handle) = r.handle {
               put_u16(&mut out, handle);
            }
            out.extend_from_slice(&r.payload);
         },
         Self::ErrorResponse(e) => {
            out.push(e.request_opcode);
            put_u16(&mut out, e.handle);
            out.push(e.code.raw());
         },
         Self::Notification(hv) | Self::Indication(hv) => {
            put_u16(&mut out, hv.handle);
            out.extend_from_slice(&hv.value);
         },
      }
      out
   }
}

/// Decodes a PDU received from the server.
pub fn decode(data: &[u8]) -> Result<DecodedMessage, FrameError> {
   let opcode = opcode_of(data)?;
   let response = |handle, payload: &[u8]| {
      DecodedMessage::Response(Response {
         opcode,
         handle,
         payload: payload.to_vec(),
      })
   };

   let message = match opcode {
      Opcode::ErrorResponse => {
         exact(opcode, data, 5)?;
         DecodedMessage::ErrorResponse(ErrorResponse {
            request_opcode: data[1],
            handle: le16(data, 2),
            code: AttErrorCode::from_raw(data[4]),
         })
      },
      Opcode::HandleValueNotification | Opcode::HandleValueIndication => {
         at_least(opcode, data, 3)?;
         let hv = HandleValue {
            handle: le16(data, 1),
            value: data[3..].to_vec(),
         };
         if opcode == Opcode::HandleValueNotification {
            DecodedMessage::Notification(hv)
         } else {
            DecodedMessage::Indication(hv)
         }
      },
      Opcode::ExchangeMtuResponse => {
         exact(opcode, data, 3)?;
         response(None, &data[1..])
      },
      Opcode::FindInformationResponse => {
         at_least(opcode, data, 2)?;
         let entry = match data[1] {
            0x01 => 4,
            0x02 => 18,
            _ => {
               return Err(FrameError::InvalidFormat {
                  opcode,
                  reason: "unknown format",
               });
            },
         };
         attribute_list(opcode, &data[2..], entry)?;
         response(None, &data[1..])
      },
      Opcode::FindByTypeValueResponse => {
         attribute_list(opcode, &data[1..], 4)?;
         response(None, &data[1..])
      },
      Opcode::ReadByTypeResponse | Opcode::ReadByGroupTypeResponse => {
         at_least(opcode, data, 2)?;
         let entry = usize::from(data[1]);
         let min_entry = if opcode == Opcode::ReadByTypeResponse {
            2
         } else {
            4
         };
         if entry < min_entry {
            return Err(FrameError::InvalidFormat {
               opcode,
               reason: "entry length too small",
            });
         }
         attribute_list(opcode, &data[2..], entry)?;
         response(None, &data[1..])
      },
      Opcode::ReadResponse | Opcode::ReadBlobResponse | Opcode::ReadMultipleResponse => {
         response(None, &data[1..])
      },
      Opcode::WriteResponse | Opcode::ExecuteWriteResponse => {
         exact(opcode, data, 1)?;
         response(None, &[])
      },
      Opcode::PrepareWriteResponse => {
         at_least(opcode, data, 5)?;
         response(Some(le16(data, 1)), &data[3..])
      },
      other => return Err(FrameError::WrongDirection(other)),
   };
   Ok(message)
}

fn opcode_of(data: &[u8]) -> Result<Opcode, FrameError> {
   let first = *data.first().ok_or(FrameError::Empty)?;
   Opcode::from_repr(first).ok_or(FrameError::UnknownOpcode(first))
}

fn at_least(opcode: Opcode, data: &[u8], expected: usize) -> Result<(), FrameError> {
   if data.len() < expected {
      return Err(FrameError::TooShort {
         opcode,
         expected,
         actual: data.len(),
      });
   }
   Ok(())
}

fn exact(opcode: Opcode, data: &[u8], expected: usize) -> Result<(), FrameError> {
   at_least(opcode, data, expected)?;
   if data.len() != expected {
      return Err(FrameError::SizeMismatch {
         opcode,
         expected,
         actual: data.len(),
      });
   }
   Ok(())
}

/// Checks a non-empty list of fixed-size entries.
fn attribute_list(opcode: Opcode, list: &[u8], entry: usize) -> Result<(), FrameError> {
   if list.len() < entry {
      return Err(FrameError::TooShort {
         opcode,
         expected: entry,
         actual: list.len(),
      });
   }
   if list.len() % entry != 0 {
      return Err(FrameError::InvalidFormat {
         opcode,
         reason: "partial attribute entry",
      });
   }
   Ok(())
}

/// Caller has checked `data.len() >= at + 2`.
fn le16(data: &[u8], at: usize) -> u16 {
   u16::from_le_bytes([data[at], data[at + 1]])
}

fn put_u16(out: &mut Frame, v: u16) {
   out.extend_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
   use super::*;

   const LONG_UUID: AttUuid = AttUuid::Uuid128(0xf000aa00_0451_4000_b000_000000000000);

   fn all_requests() -> Vec<Request> {
      vec![
         Request::ExchangeMtu { mtu: 247 },
         Request::FindInformation {
            start: 0x0001,
            end: 0xFFFF,
         },
         Request::FindByTypeValue {
            start: 0x0001,
            end: 0xFFFF,
            attribute_type: 0x2800,
            value: vec![0x0F, 0x18],
         },
         Request::ReadByType {
            start: 0x0001,
            end: 0x0020,
            attribute_type: AttUuid::CHARACTERISTIC,
         },
         Request::ReadByType {
            start: 0x0001,
            end: 0x0020,
            attribute_type: LONG_UUID,
         },
         Request::Read { handle: 0x0010 },
         Request::ReadBlob {
            handle: 0x0010,
            offset: 22,
         },
         Request::ReadMultiple {
            handles: vec![0x0003, 0x0010],
         },
         Request::ReadByGroupType {
            start: 0x0001,
            end: 0xFFFF,
            group_type: AttUuid::PRIMARY_SERVICE,
         },
         Request::ReadByGroupType {
            start: 0x0001,
            end: 0xFFFF,
            group_type: LONG_UUID,
         },
         Request::Write {
            handle: 0x0011,
            value: vec![0x01, 0x00],
         },
         Request::Write {
            handle: 0x0011,
            value: vec![],
         },
         Request::WriteCommand {
            handle: 0x0010,
            value: b"hello".to_vec(),
         },
         Request::PrepareWrite {
            handle: 0x0010,
            offset: 18,
            value: vec![1, 2, 3],
         },
         Request::ExecuteWrite { commit: true },
         Request::ExecuteWrite { commit: false },
         Request::HandleValueConfirmation,
      ]
   }

   fn all_messages() -> Vec<DecodedMessage> {
      let resp = |opcode, handle, payload: &[u8]| {
         DecodedMessage::Response(Response {
            opcode,
            handle,
            payload: payload.to_vec(),
         })
      };
      vec![
         resp(Opcode::ExchangeMtuResponse, None, &[0x17, 0x00]),
         resp(
            Opcode::FindInformationResponse,
            None,
            &[0x01, 0x11, 0x00, 0x02, 0x29],
         ),
         resp(Opcode::FindInformationResponse, None, &{
            let mut v = vec![0x02, 0x12, 0x00];
            v.extend_from_slice(&LONG_UUID.to_le_bytes());
            v
         }),
         resp(
            Opcode::FindByTypeValueResponse,
            None,
            &[0x01, 0x00, 0x05, 0x00],
         ),
         resp(
            Opcode::ReadByTypeResponse,
            None,
            &[0x07, 0x0F, 0x00, 0x12, 0x10, 0x00, 0x00, 0x2A],
         ),
         resp(
            Opcode::ReadByGroupTypeResponse,
            None,
            &[0x06, 0x01, 0x00, 0x05, 0x00, 0x00, 0x18],
         ),
         resp(Opcode::ReadResponse, None, b"bluepy"),
         resp(Opcode::ReadResponse, None, &[]),
         resp(Opcode::ReadBlobResponse, None, &[9, 8, 7]),
         resp(Opcode::ReadMultipleResponse, None, &[1, 2]),
         resp(Opcode::WriteResponse, None, &[]),
         resp(Opcode::PrepareWriteResponse, Some(0x0010), &[0x12, 0x00, 1, 2, 3]),
         resp(Opcode::ExecuteWriteResponse, None, &[]),
         DecodedMessage::ErrorResponse(ErrorResponse {
            request_opcode: Opcode::ReadByGroupTypeRequest.id(),
            handle: 0x0006,
            code: AttErrorCode::AttributeNotFound,
         }),
         DecodedMessage::ErrorResponse(ErrorResponse {
            request_opcode: Opcode::WriteRequest.id(),
            handle: 0x0010,
            code: AttErrorCode::Application(0x80),
         }),
         DecodedMessage::Notification(HandleValue {
            handle: 0x0010,
            value: vec![0xDE, 0xAD],
         }),
         DecodedMessage::Notification(HandleValue {
            handle: 0x0010,
            value: vec![],
         }),
         DecodedMessage::Indication(HandleValue {
            handle: 0x0020,
            value: vec![0x42],
         }),
      ]
   }

   #[test]
   fn test_request_round_trip() {
      for request in all_requests() {
         let bytes = request.encode();
         let decoded = Request::decode(&bytes)
            .unwrap_or_else(|e| panic!("{request:?} failed to decode: {e}"));
         assert_eq!(decoded, request);
         if let Request::ReadByType {
            attribute_type: uuid,
            ..
         }
         | Request::ReadByGroupType {
            group_type: uuid,
            ..
         } = request
         {
            assert_eq!(bytes.len(), 5 + uuid.wire_len());
         }
      }
   }

   #[test]
   fn test_message_round_trip() {
      for message in all_messages() {
         let bytes = message.encode();
         let decoded =
            decode(&bytes).unwrap_or_else(|e| panic!("{message:?} failed to decode: {e}"));
         assert_eq!(decoded, message);
      }
   }

   #[test]
   fn test_known_layouts() {
      assert_eq!(
         Request::Read { handle: 0x0010 }.encode().as_slice(),
         &[0x0A, 0x10, 0x00]
      );
      assert_eq!(
         Request::ReadByGroupType {
            start: 0x0001,
            end: 0xFFFF,
            group_type: AttUuid::PRIMARY_SERVICE,
         }
         .encode()
         .as_slice(),
         &[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]
      );
      let err = decode(&[0x01, 0x0A, 0x10, 0x00, 0x02]).unwrap();
      assert_eq!(err.opcode(), Opcode::ErrorResponse);
      assert_eq!(err.handle(), Some(0x0010));
      assert!(matches!(
         err,
         DecodedMessage::ErrorResponse(ErrorResponse {
            request_opcode: 0x0A,
            code: AttErrorCode::ReadNotPermitted,
            ..
         })
      ));
   }

   /// Shortest well-formed PDU for each opcode.
   fn min_len(opcode: Opcode) -> usize {
      match opcode {
         Opcode::ReadResponse
         | Opcode::ReadBlobResponse
         | Opcode::ReadMultipleResponse
         | Opcode::WriteResponse
         | Opcode::ExecuteWriteResponse
         | Opcode::HandleValueConfirmation => 1,
         Opcode::ExecuteWriteRequest => 2,
         Opcode::ExchangeMtuRequest
         | Opcode::ExchangeMtuResponse
         | Opcode::ReadRequest
         | Opcode::WriteRequest
         | Opcode::WriteCommand
         | Opcode::HandleValueNotification
         | Opcode::HandleValueIndication => 3,
         Opcode::ErrorResponse
         | Opcode::FindInformationRequest
         | Opcode::ReadBlobRequest
         | Opcode::ReadMultipleRequest
         | Opcode::PrepareWriteRequest
         | Opcode::PrepareWriteResponse
         | Opcode::FindByTypeValueResponse => 5,
         Opcode::FindInformationResponse => 6,
         Opcode::FindByTypeValueRequest
         | Opcode::ReadByTypeRequest
         | Opcode::ReadByGroupTypeRequest => 7,
         Opcode::ReadByTypeResponse => 4,
         Opcode::ReadByGroupTypeResponse => 6,
      }
   }

   #[test]
   fn test_truncated_frames_are_malformed() {
      for message in all_messages() {
         let bytes = message.encode();
         for len in 0..min_len(message.opcode()) {
            assert!(
               decode(&bytes[..len]).is_err(),
               "{message:?} truncated to {len} decoded"
            );
         }
      }
      for request in all_requests() {
         let bytes = request.encode();
         for len in 0..min_len(request.opcode()) {
            assert!(
               Request::decode(&bytes[..len]).is_err(),
               "{request:?} truncated to {len} decoded"
            );
         }
      }
   }

   #[test]
   fn test_malformed_attribute_lists() {
      // Entry length 7 but only 5 bytes of data.
      assert!(matches!(
         decode(&[0x09, 0x07, 0x0F, 0x00, 0x12, 0x10, 0x00]),
         Err(FrameError::TooShort { .. })
      ));
      // Partial trailing entry.
      assert!(matches!(
         decode(&[0x11, 0x06, 0x01, 0x00, 0x05, 0x00, 0x00, 0x18, 0x06]),
         Err(FrameError::InvalidFormat { .. })
      ));
      // Unknown Find Information format.
      assert!(matches!(
         decode(&[0x05, 0x03, 0x11, 0x00, 0x02, 0x29]),
         Err(FrameError::InvalidFormat { .. })
      ));
      assert_eq!(decode(&[]), Err(FrameError::Empty));
      assert_eq!(decode(&[0xFF]), Err(FrameError::UnknownOpcode(0xFF)));
      assert_eq!(
         decode(&[0x0A, 0x10, 0x00]),
         Err(FrameError::WrongDirection(Opcode::ReadRequest))
      );
   }
}
