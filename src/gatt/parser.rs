//! Attribute data parsing for discovery responses.
//!
//! Each function takes the response payload as produced by
//! [`crate::att::decode`], i.e. without the opcode but with the leading
//! length or format byte.

use crate::{
   att::{AttUuid, FrameError, Opcode},
   gatt::{Characteristic, Descriptor, Properties, Service},
};

/// (handle, value) pairs from a Read By Type response.
pub fn parse_handle_values(payload: &[u8]) -> Result<Vec<(u16, Vec<u8>)>, FrameError> {
   let entries = entries(Opcode::ReadByTypeResponse, payload, 2)?;
   Ok(entries
      .map(|e| (le16(e), e[2..].to_vec()))
      .collect())
}

/// Primary services from a Read By Group Type response.
pub fn parse_services(payload: &[u8]) -> Result<Vec<Service>, FrameError> {
   let opcode = Opcode::ReadByGroupTypeResponse;
   entries(opcode, payload, 4)?
      .map(|e| {
         let start_handle = le16(e);
         let end_handle = le16(&e[2..]);
         if end_handle < start_handle {
            return Err(FrameError::InvalidFormat {
               opcode,
               reason: "group end precedes start",
            });
         }
         Ok(Service {
            start_handle,
            end_handle,
            uuid: AttUuid::from_le_slice(&e[4..])?,
         })
      })
      .collect()
}

/// Characteristic declarations from a Read By Type response over 0x2803.
///
/// `end_handle` is provisional (equal to the value handle); the caller fixes
/// it once the next declaration or the service end is known.
pub fn parse_characteristics(payload: &[u8]) -> Result<Vec<Characteristic>, FrameError> {
   let opcode = Opcode::ReadByTypeResponse;
   entries(opcode, payload, 2)?
      .map(|e| {
         let value = &e[2..];
         if value.len() != 5 && value.len() != 19 {
            return Err(FrameError::InvalidFormat {
               opcode,
               reason: "bad characteristic declaration",
            });
         }
         let value_handle = le16(&value[1..]);
         Ok(Characteristic {
            declaration_handle: le16(e),
            value_handle,
            end_handle: value_handle,
            properties: Properties(value[0]),
            uuid: AttUuid::from_le_slice(&value[3..])?,
         })
      })
      .collect()
}

/// Sets each characteristic's end handle from its successor.
pub fn close_characteristic_ranges(chars: &mut [Characteristic], service_end: u16) {
   let starts: Vec<u16> = chars.iter().skip(1).map(|c| c.declaration_handle).collect();
   for (c, next) in chars.iter_mut().zip(starts.into_iter().map(Some).chain([None])) {
      c.end_handle = match next {
         Some(next) => next.saturating_sub(1).max(c.value_handle),
         None => service_end.max(c.value_handle),
      };
   }
}

/// Handle/UUID pairs from a Find Information response.
pub fn parse_descriptors(payload: &[u8]) -> Result<Vec<Descriptor>, FrameError> {
   let opcode = Opcode::FindInformationResponse;
   let (&format, list) = payload.split_first().ok_or(FrameError::TooShort {
      opcode,
      expected: 2,
      actual: 1,
   })?;
   let entry = match format {
      0x01 => 4,
      0x02 => 18,
      _ => {
         return Err(FrameError::InvalidFormat {
            opcode,
            reason: "unknown format",
         });
      },
   };
   if list.is_empty() || list.len() % entry != 0 {
      return Err(FrameError::InvalidFormat {
         opcode,
         reason: "partial attribute entry",
      });
   }
   list
      .chunks_exact(entry)
      .map(|e| {
         Ok(Descriptor {
            handle: le16(e),
            uuid: AttUuid::from_le_slice(&e[2..])?,
         })
      })
      .collect()
}

/// Server Rx MTU from an Exchange MTU response.
pub fn parse_mtu(payload: &[u8]) -> Result<u16, FrameError> {
   match payload {
      [lo, hi] => Ok(u16::from_le_bytes([*lo, *hi])),
      _ => Err(FrameError::SizeMismatch {
         opcode: Opcode::ExchangeMtuResponse,
         expected: 3,
         actual: payload.len() + 1,
      }),
   }
}

fn entries(
   opcode: Opcode,
   payload: &[u8],
   min_entry: usize,
) -> Result<std::slice::ChunksExact<'_, u8>, FrameError> {
   let (&len, list) = payload.split_first().ok_or(FrameError::TooShort {
      opcode,
      expected: 2,
      actual: 1,
   })?;
   let len = usize::from(len);
   if len < min_entry {
      return Err(FrameError::InvalidFormat {
         opcode,
         reason: "entry length too small",
      });
   }
   if list.is_empty() || list.len() % len != 0 {
      return Err(FrameError::InvalidFormat {
         opcode,
         reason: "partial attribute entry",
      });
   }
   Ok(list.chunks_exact(len))
}

fn le16(data: &[u8]) -> u16 {
   u16::from_le_bytes([data[0], data[1]])
}
