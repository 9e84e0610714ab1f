use std::str::FromStr;

use bluepy::{
   Error,
   att::AttUuid,
   manager::SessionManager,
   transport::AddressType,
};
use bluer::Address;
use log::info;
use serde_json::json;
use zbus::{interface, object_server::SignalEmitter};

pub const BUS_NAME: &str = "org.bluepy";
pub const OBJECT_PATH: &str = "/org/bluepy/manager";

pub struct BluepyService {
   manager: SessionManager,
}

impl BluepyService {
   pub const fn new(manager: SessionManager) -> Self {
      Self { manager }
   }
}

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn to_fdo(err: Error) -> zbus::fdo::Error {
   match err {
      Error::InvalidArgument(msg) => zbus::fdo::Error::InvalidArgs(msg),
      err => zbus::fdo::Error::Failed(err.to_string()),
   }
}

#[interface(name = "org.bluepy.Manager1")]
impl BluepyService {
   async fn connect(&self, address: String, address_type: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let address_type = AddressType::from_str(&address_type).map_err(|_| {
         zbus::fdo::Error::InvalidArgs(format!("Invalid address type: {address_type}"))
      })?;

      self
         .manager
         .connect(addr, address_type)
         .await
         .map_err(to_fdo)?;

      info!("Connected to {address} over D-Bus request");
      Ok(true)
   }

   async fn disconnect(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.manager.disconnect(addr).await.map_err(to_fdo)?;
      Ok(true)
   }

   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      let devices = self.manager.devices().await;
      serde_json::to_string(&devices).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn discover_services(&self, address: String) -> zbus::fdo::Result<String> {
      let client = self
         .manager
         .client(parse_address(&address)?)
         .await
         .map_err(to_fdo)?;
      let services = client.discover_services().await.map_err(to_fdo)?;
      let services: Vec<_> = services.iter().map(|s| s.to_json()).collect();
      Ok(serde_json::Value::Array(services).to_string())
   }

   async fn discover_characteristics(
      &self,
      address: String,
      service_start: u16,
   ) -> zbus::fdo::Result<String> {
      let client = self
         .manager
         .client(parse_address(&address)?)
         .await
         .map_err(to_fdo)?;
      let service = client
         .services()
         .into_iter()
         .find(|s| s.start_handle == service_start)
         .ok_or_else(|| {
            zbus::fdo::Error::InvalidArgs(format!("No service starts at 0x{service_start:04x}"))
         })?;

      let chars = client
         .discover_characteristics(&service)
         .await
         .map_err(to_fdo)?;
      let chars: Vec<_> = chars.iter().map(|c| c.to_json()).collect();
      Ok(serde_json::Value::Array(chars).to_string())
   }

   async fn discover_descriptors(
      &self,
      address: String,
      value_handle: u16,
   ) -> zbus::fdo::Result<String> {
      let client = self
         .manager
         .client(parse_address(&address)?)
         .await
         .map_err(to_fdo)?;
      let characteristic = client
         .characteristics()
         .into_iter()
         .find(|c| c.value_handle == value_handle)
         .ok_or_else(|| {
            zbus::fdo::Error::InvalidArgs(format!(
               "No characteristic with value handle 0x{value_handle:04x}"
            ))
         })?;

      let descriptors = client
         .discover_descriptors(&characteristic)
         .await
         .map_err(to_fdo)?;
      let descriptors: Vec<_> = descriptors.iter().map(|d| d.to_json()).collect();
      Ok(serde_json::Value::Array(descriptors).to_string())
   }

   async fn read(&self, address: String, handle: u16) -> zbus::fdo::Result<String> {
      let client = self
         .manager
         .client(parse_address(&address)?)
         .await
         .map_err(to_fdo)?;
      let value = client.read_characteristic(handle).await.map_err(to_fdo)?;
      Ok(hex::encode(value))
   }

   async fn read_by_uuid(
      &self,
      address: String,
      start: u16,
      end: u16,
      uuid: String,
   ) -> zbus::fdo::Result<String> {
      let uuid =
         AttUuid::from_str(&uuid).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      let client = self
         .manager
         .client(parse_address(&address)?)
         .await
         .map_err(to_fdo)?;

      let values = client.read_by_uuid(start, end, uuid).await.map_err(to_fdo)?;
      let values: Vec<_> = values
         .iter()
         .map(|(handle, value)| json!({ "handle": handle, "value": hex::encode(value) }))
         .collect();
      Ok(serde_json::Value::Array(values).to_string())
   }

   async fn write(
      &self,
      address: String,
      handle: u16,
      value: String,
      with_response: bool,
   ) -> zbus::fdo::Result<bool> {
      let value = hex::decode(value).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      let client = self
         .manager
         .client(parse_address(&address)?)
         .await
         .map_err(to_fdo)?;

      client
         .write_characteristic(handle, &value, with_response)
         .await
         .map_err(to_fdo)?;
      Ok(true)
   }

   async fn subscribe(&self, address: String, handle: u16) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.manager.subscribe(addr, handle).await.map_err(to_fdo)?;
      info!("Subscribed to 0x{handle:04x} on {address}");
      Ok(true)
   }

   async fn unsubscribe(&self, address: String, handle: u16) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.manager.unsubscribe(addr, handle).await.map_err(to_fdo)?;
      Ok(true)
   }

   async fn exchange_mtu(&self, address: String, mtu: u16) -> zbus::fdo::Result<u16> {
      let client = self
         .manager
         .client(parse_address(&address)?)
         .await
         .map_err(to_fdo)?;
      client.exchange_mtu(mtu).await.map_err(to_fdo)
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(
      emitter: &SignalEmitter<'_>,
      address: &str,
      reason: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn notification(
      emitter: &SignalEmitter<'_>,
      address: &str,
      handle: u16,
      value: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_error(
      emitter: &SignalEmitter<'_>,
      address: &str,
      message: &str,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices().await.unwrap_or_default()
   }

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      let connected = self
         .manager
         .devices()
         .await
         .iter()
         .filter(|d| !d.state.is_terminal())
         .count();
      u32::try_from(connected).unwrap_or(u32::MAX)
   }
}
