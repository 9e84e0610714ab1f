//! Attribute type UUIDs.
//!
//! ATT carries UUIDs either as 16-bit aliases of the Bluetooth base UUID or as
//! full 128-bit values, both little-endian on the wire.

use std::{
   fmt,
   hash::{Hash, Hasher},
   str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::att::FrameError;

/// `0000xxxx-0000-1000-8000-00805f9b34fb`
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const BASE_MASK: u128 = !(0xffff_ffff_u128 << 96);

/// A UUID as it appears in an attribute PDU.
///
/// Equality and hashing compare the expanded 128-bit value, so a 16-bit alias
/// equals its 128-bit expansion while each keeps its own wire length.
#[derive(Debug, Clone, Copy)]
pub enum AttUuid {
   Uuid16(u16),
   Uuid128(u128),
}

impl AttUuid {
   pub const PRIMARY_SERVICE: Self = Self::Uuid16(0x2800);
   pub const SECONDARY_SERVICE: Self = Self::Uuid16(0x2801);
   pub const INCLUDE: Self = Self::Uuid16(0x2802);
   pub const CHARACTERISTIC: Self = Self::Uuid16(0x2803);
   pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Self = Self::Uuid16(0x2902);

   /// Parses a 2 or 16 byte little-endian UUID.
   pub fn from_le_slice(bytes: &[u8]) -> Result<Self, FrameError> {
      match bytes.len() {
         2 => Ok(Self::Uuid16(u16::from_le_bytes([bytes[0], bytes[1]]))),
         16 => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(bytes);
            Ok(Self::Uuid128(u128::from_le_bytes(raw)))
         },
         n => Err(FrameError::InvalidUuidLength(n)),
      }
   }

   /// Wire representation, little-endian.
   pub fn to_le_bytes(self) -> heapless::Vec<u8, 16> {
      let mut out = heapless::Vec::new();
      match self {
         Self::Uuid16(v) => {
            let _ = out.extend_from_slice(&v.to_le_bytes());
         },
         Self::Uuid128(v) => {
            let _ = out.extend_from_slice(&v.to_le_bytes());
         },
      }
      out
   }

   /// Number of bytes on the wire.
   pub const fn wire_len(self) -> usize {
      match self {
         Self::Uuid16(_) => 2,
         Self::Uuid128(_) => 16,
      }
   }

   pub const fn as_u128(self) -> u128 {
      match self {
         Self::Uuid16(v) => BASE_UUID | ((v as u128) << 96),
         Self::Uuid128(v) => v,
      }
   }

   /// The 16-bit alias, if the value lies in the Bluetooth base range.
   pub const fn as_u16(self) -> Option<u16> {
      match self {
         Self::Uuid16(v) => Some(v),
         Self::Uuid128(v) => {
            if v & BASE_MASK == BASE_UUID && (v >> 112) == 0 {
               Some((v >> 96) as u16)
            } else {
               None
            }
         },
      }
   }

   pub const fn to_uuid(self) -> Uuid {
      Uuid::from_u128(self.as_u128())
   }

   /// Shortest wire form for `uuid`.
   pub fn from_uuid(uuid: Uuid) -> Self {
      let v = uuid.as_u128();
      match Self::Uuid128(v).as_u16() {
         Some(short) => Self::Uuid16(short),
         None => Self::Uuid128(v),
      }
   }
}

impl PartialEq for AttUuid {
   fn eq(&self, other: &Self) -> bool {
      self.as_u128() == other.as_u128()
   }
}

impl Eq for AttUuid {}

impl Hash for AttUuid {
   fn hash<H: Hasher>(&self, state: &mut H) {
      self.as_u128().hash(state);
   }
}

impl From<u16> for AttUuid {
   fn from(v: u16) -> Self {
      Self::Uuid16(v)
   }
}

impl From<Uuid> for AttUuid {
   fn from(uuid: Uuid) -> Self {
      Self::from_uuid(uuid)
   }
}

impl fmt::Display for AttUuid {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Display::fmt(&self.to_uuid().hyphenated(), f)
   }
}

impl FromStr for AttUuid {
   type Err = uuid::Error;

   /// Accepts `2a00`, `0x2a00` or a full hyphenated UUID.
   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
      if trimmed.len() <= 4
         && let Ok(short) = u16::from_str_radix(trimmed, 16)
      {
         return Ok(Self::Uuid16(short));
      }
      if trimmed.len() <= 8
         && let Ok(mid) = u32::from_str_radix(trimmed, 16)
      {
         return Ok(Self::Uuid128(BASE_UUID | (u128::from(mid) << 96)));
      }
      Uuid::parse_str(s).map(|uuid| Self::Uuid128(uuid.as_u128()))
   }
}

impl Serialize for AttUuid {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(self)
   }
}

impl<'de> Deserialize<'de> for AttUuid {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      let s = String::deserialize(deserializer)?;
      s.parse().map_err(serde::de::Error::custom)
   }
}
