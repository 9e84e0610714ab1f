//! Configuration management.
//!
//! The daemon reads a TOML file holding the adapter, session timeouts and
//! the peripherals it should manage. Library users build a [`SessionConfig`]
//! directly.

use std::{env, fs, path::PathBuf, time::Duration};

use bluer::Address;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   att::DEFAULT_MTU,
   error::{Error, Result},
   transport::{AddressType, SecurityLevel},
};

/// Per-session parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
   pub connect_timeout: Duration,
   /// Deadline for each request/response exchange.
   pub request_timeout: Duration,
   /// MTU requested right after connecting; the default performs no exchange.
   pub preferred_mtu: u16,
   pub security: SecurityLevel,
}

impl Default for SessionConfig {
   fn default() -> Self {
      Self {
         connect_timeout: Duration::from_millis(default_connect_timeout()),
         request_timeout: Duration::from_millis(default_request_timeout()),
         preferred_mtu: DEFAULT_MTU,
         security: SecurityLevel::default(),
      }
   }
}

/// Daemon configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default = "default_adapter")]
   pub adapter: SmolStr,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_ms: u64,

   #[serde(default = "default_request_timeout")]
   pub request_timeout_ms: u64,

   #[serde(default = "default_mtu")]
   pub preferred_mtu: u16,

   #[serde(default)]
   pub security_level: SecurityLevel,

   #[serde(default = "default_reconnect_delay")]
   pub reconnect_delay_sec: u64,

   #[serde(default = "default_reconnect_attempts")]
   pub max_reconnect_attempts: u32,

   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,
}

/// A peripheral the daemon knows about.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KnownDevice {
   #[serde(with = "address_string")]
   pub address: Address,
   #[serde(default)]
   pub address_type: AddressType,
   #[serde(default)]
   pub name: SmolStr,
   /// Connect at start-up and reconnect after link loss.
   #[serde(default)]
   pub auto_connect: bool,
}

fn default_adapter() -> SmolStr {
   SmolStr::new_static("hci0")
}

const fn default_connect_timeout() -> u64 {
   10_000
}

const fn default_request_timeout() -> u64 {
   5_000
}

const fn default_mtu() -> u16 {
   DEFAULT_MTU
}

const fn default_reconnect_delay() -> u64 {
   2
}

const fn default_reconnect_attempts() -> u32 {
   5
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: default_adapter(),
         connect_timeout_ms: default_connect_timeout(),
         request_timeout_ms: default_request_timeout(),
         preferred_mtu: default_mtu(),
         security_level: SecurityLevel::default(),
         reconnect_delay_sec: default_reconnect_delay(),
         max_reconnect_attempts: default_reconnect_attempts(),
         known_devices: vec![],
      }
   }
}

impl Config {
   /// Loads configuration from disk, writing the defaults if there is none.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BLUEPY_HOME") {
         PathBuf::from(home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(Error::ConfigDirNotFound);
      };

      Ok(config_dir.join("bluepy").join("config.toml"))
   }

   pub fn session_config(&self) -> SessionConfig {
      SessionConfig {
         connect_timeout: Duration::from_millis(self.connect_timeout_ms),
         request_timeout: Duration::from_millis(self.request_timeout_ms),
         preferred_mtu: self.preferred_mtu,
         security: self.security_level,
      }
   }

   pub fn known_device(&self, address: Address) -> Option<&KnownDevice> {
      self.known_devices.iter().find(|d| d.address == address)
   }

   pub fn auto_connect_devices(&self) -> impl Iterator<Item = &KnownDevice> {
      self.known_devices.iter().filter(|d| d.auto_connect)
   }
}

/// Addresses are stored as `AA:BB:CC:DD:EE:FF`.
mod address_string {
   use bluer::Address;
   use serde::{Deserialize, Deserializer, Serializer};

   pub fn serialize<S: Serializer>(address: &Address, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(address)
   }

   pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Address, D::Error> {
      let s = String::deserialize(deserializer)?;
      s.parse().map_err(serde::de::Error::custom)
   }
}
