//! In-process BLE GATT client for BlueZ.
//!
//! A [`Client`] is one session with one peripheral: it owns an ATT link,
//! serialises request/response exchanges over it and routes notifications
//! to per-handle callbacks. Sessions are opened through an explicit
//! [`Adapter`], which can also be backed by the in-memory transport.
//!
//! ```no_run
//! # async fn demo() -> bluepy::Result<()> {
//! use bluepy::{Adapter, AddressType, Client, SessionConfig};
//!
//! let adapter = Adapter::open("hci0", SessionConfig::default()).await?;
//! let address = "C0:FF:EE:00:00:01".parse().expect("valid address");
//! let client = Client::connect(&adapter, address, AddressType::Random).await?;
//! for service in client.discover_services().await? {
//!    println!("{}", service.to_json());
//! }
//! client.disconnect().await
//! # }
//! ```

pub mod adapter;
pub mod att;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod gatt;
pub mod manager;
pub mod session;
pub mod transport;

pub use adapter::Adapter;
pub use client::Client;
pub use config::{Config, SessionConfig};
pub use error::{Error, Result};
pub use event::{EventBus, EventSender, SessionEvent};
pub use gatt::{Characteristic, Descriptor, Properties, Service};
pub use session::{CloseReason, SessionState};
pub use transport::{AddressType, SecurityLevel, Transport};
