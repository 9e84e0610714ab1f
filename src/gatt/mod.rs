//! GATT entities discovered on a peripheral.
//!
//! Handles are stable for the lifetime of a session; the cache is dropped
//! when the session ends.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::att::AttUuid;

pub mod parser;
#[cfg(test)]
pub(crate) mod sim;

/// A primary service and the handle range it spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
   pub start_handle: u16,
   pub end_handle: u16,
   pub uuid: AttUuid,
}

impl Service {
   pub const fn contains(&self, handle: u16) -> bool {
      self.start_handle <= handle && handle <= self.end_handle
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "start": self.start_handle,
         "end": self.end_handle,
         "uuid": self.uuid.to_string(),
      })
   }
}

/// Characteristic property bits from the declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(pub u8);

impl Properties {
   pub const BROADCAST: Self = Self(0x01);
   pub const READ: Self = Self(0x02);
   pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
   pub const WRITE: Self = Self(0x08);
   pub const NOTIFY: Self = Self(0x10);
   pub const INDICATE: Self = Self(0x20);
   pub const AUTHENTICATED_SIGNED_WRITES: Self = Self(0x40);
   pub const EXTENDED_PROPERTIES: Self = Self(0x80);

   const NAMES: [(Self, &'static str); 8] = [
      (Self::BROADCAST, "BROADCAST"),
      (Self::READ, "READ"),
      (Self::WRITE_WITHOUT_RESPONSE, "WRITE NO RESPONSE"),
      (Self::WRITE, "WRITE"),
      (Self::NOTIFY, "NOTIFY"),
      (Self::INDICATE, "INDICATE"),
      (Self::AUTHENTICATED_SIGNED_WRITES, "SIGNED WRITE"),
      (Self::EXTENDED_PROPERTIES, "EXTENDED PROPERTIES"),
   ];

   pub const fn contains(self, other: Self) -> bool {
      self.0 & other.0 == other.0
   }

   pub fn names(self) -> impl Iterator<Item = &'static str> {
      Self::NAMES
         .into_iter()
         .filter(move |(flag, _)| self.contains(*flag))
         .map(|(_, name)| name)
   }
}

impl std::ops::BitOr for Properties {
   type Output = Self;

   fn bitor(self, rhs: Self) -> Self {
      Self(self.0 | rhs.0)
   }
}

impl fmt::Display for Properties {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      for (i, name) in self.names().enumerate() {
         if i > 0 {
            f.write_str(" ")?;
         }
         f.write_str(name)?;
      }
      Ok(())
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
   /// Handle of the 0x2803 declaration.
   pub declaration_handle: u16,
   pub value_handle: u16,
   /// Last handle belonging to this characteristic, descriptors included.
   pub end_handle: u16,
   pub properties: Properties,
   pub uuid: AttUuid,
}

impl Characteristic {
   /// Value written to the CCCD to enable updates. Indications are used only
   /// when notifications are unsupported.
   pub const fn subscribe_value(&self) -> u16 {
      if !self.properties.contains(Properties::NOTIFY)
         && self.properties.contains(Properties::INDICATE)
      {
         0x0002
      } else {
         0x0001
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "handle": self.declaration_handle,
         "value_handle": self.value_handle,
         "end": self.end_handle,
         "uuid": self.uuid.to_string(),
         "properties": self.properties.names().collect::<Vec<_>>(),
      })
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
   pub handle: u16,
   pub uuid: AttUuid,
}

impl Descriptor {
   pub fn to_json(&self) -> serde_json::Value {
      json!({ "handle": self.handle, "uuid": self.uuid.to_string() })
   }
}

/// Everything discovered during one session.
#[derive(Debug, Clone, Default)]
pub struct GattCache {
   services: Vec<Service>,
   characteristics: BTreeMap<u16, Characteristic>,
   descriptors: BTreeMap<u16, Descriptor>,
}

impl GattCache {
   pub fn services(&self) -> &[Service] {
      &self.services
   }

   pub fn set_services(&mut self, services: Vec<Service>) {
      self.services = services;
   }

   pub fn insert_characteristics(&mut self, chars: &[Characteristic]) {
      for c in chars {
         self.characteristics.insert(c.value_handle, *c);
      }
   }

   pub fn insert_descriptors(&mut self, descriptors: &[Descriptor]) {
      for d in descriptors {
         self.descriptors.insert(d.handle, *d);
      }
   }

   /// Characteristic by value handle.
   pub fn characteristic(&self, value_handle: u16) -> Option<&Characteristic> {
      self.characteristics.get(&value_handle)
   }

   pub fn characteristics(&self) -> impl Iterator<Item = &Characteristic> {
      self.characteristics.values()
   }

   /// Known CCCD handle for the characteristic with this value handle.
   pub fn cccd_handle(&self, value_handle: u16) -> Option<u16> {
      let end = self.characteristic(value_handle)?.end_handle;
      self
         .descriptors
         .range(value_handle.saturating_add(1)..=end)
         .find(|(_, d)| d.uuid == AttUuid::CLIENT_CHARACTERISTIC_CONFIGURATION)
         .map(|(handle, _)| *handle)
   }

   pub fn clear(&mut self) {
      self.services.clear();
      self.characteristics.clear();
      self.descriptors.clear();
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn characteristic(value_handle: u16, end_handle: u16, properties: Properties) -> Characteristic {
      Characteristic {
         declaration_handle: value_handle - 1,
         value_handle,
         end_handle,
         properties,
         uuid: AttUuid::Uuid16(0x2A37),
      }
   }

   #[test]
   fn test_properties_display() {
      let props = Properties::READ | Properties::NOTIFY;
      assert_eq!(props.to_string(), "READ NOTIFY");
      assert!(props.contains(Properties::READ));
      assert!(!props.contains(Properties::WRITE));
      assert_eq!(Properties::default().to_string(), "");
   }

   #[test]
   fn test_subscribe_value() {
      assert_eq!(characteristic(3, 4, Properties::NOTIFY).subscribe_value(), 1);
      assert_eq!(characteristic(3, 4, Properties::INDICATE).subscribe_value(), 2);
      let both = Properties::NOTIFY | Properties::INDICATE;
      assert_eq!(characteristic(3, 4, both).subscribe_value(), 1);
   }

   #[test]
   fn test_cccd_lookup_stays_in_range() {
      let mut cache = GattCache::default();
      cache.insert_characteristics(&[
         characteristic(0x0003, 0x0005, Properties::NOTIFY),
         characteristic(0x0007, 0x0008, Properties::NOTIFY),
      ]);
      cache.insert_descriptors(&[
         Descriptor {
            handle: 0x0004,
            uuid: AttUuid::Uuid16(0x2901),
         },
         Descriptor {
            handle: 0x0005,
            uuid: AttUuid::CLIENT_CHARACTERISTIC_CONFIGURATION,
         },
         Descriptor {
            handle: 0x0008,
            uuid: AttUuid::CLIENT_CHARACTERISTIC_CONFIGURATION,
         },
      ]);

      assert_eq!(cache.cccd_handle(0x0003), Some(0x0005));
      assert_eq!(cache.cccd_handle(0x0007), Some(0x0008));
      assert_eq!(cache.cccd_handle(0x0010), None);

      cache.clear();
      assert_eq!(cache.cccd_handle(0x0003), None);
   }
}
