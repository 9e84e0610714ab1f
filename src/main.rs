//! `bluepyd`: BLE GATT session daemon.
//!
//! Keeps GATT sessions to the configured peripherals open and exposes them
//! on the session bus, turning session events into D-Bus signals.

use std::sync::Arc;

use bluepy::{
   Adapter, Config, Result,
   event::{EventBus, SessionEvent},
   manager::SessionManager,
};
use bluer::Address;
use log::{debug, info, warn};
use tokio::{signal, sync::mpsc};
use zbus::{connection, object_server::InterfaceRef};

use dbus::{BUS_NAME, BluepyService, OBJECT_PATH};

mod dbus;

use crate::dbus::BluepyServiceSignals;

type Signal = (Address, SessionEvent);

/// Hands session events to the signal task without blocking the worker.
struct SignalBus(mpsc::UnboundedSender<Signal>);

impl EventBus for SignalBus {
   fn emit(&self, address: Address, event: SessionEvent) {
      if self.0.send((address, event)).is_err() {
         debug!("Signal task is gone, dropping event for {address}");
      }
   }
}

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting bluepy D-Bus service...");

   let config = Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let (signals, signal_rx) = mpsc::unbounded_channel();
   let adapter = Adapter::open(&config.adapter, config.session_config())
      .await?
      .with_events(Arc::new(SignalBus(signals)));
   let manager = SessionManager::new(adapter, config);

   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, BluepyService::new(manager))?
      .build()
      .await?;
   info!("bluepy D-Bus service started at {BUS_NAME}");

   let iface = connection
      .object_server()
      .interface::<_, BluepyService>(OBJECT_PATH)
      .await?;
   tokio::spawn(forward_signals(iface, signal_rx));

   signal::ctrl_c().await?;
   info!("Shutting down bluepy service...");
   Ok(())
}

async fn forward_signals(
   iface: InterfaceRef<BluepyService>,
   mut rx: mpsc::UnboundedReceiver<Signal>,
) {
   while let Some((address, event)) = rx.recv().await {
      if let Err(e) = emit_signal(&iface, &address.to_string(), event).await {
         warn!("Error emitting signal for {address}: {e}");
      }
   }
}

async fn emit_signal(
   iface: &InterfaceRef<BluepyService>,
   address: &str,
   event: SessionEvent,
) -> zbus::Result<()> {
   match event {
      SessionEvent::Connected => iface.device_connected(address).await,
      SessionEvent::Disconnected(reason) => {
         iface
            .device_disconnected(address, &reason.to_string())
            .await
      },
      SessionEvent::StateChanged(state) => iface.state_changed(address, state.into()).await,
      SessionEvent::Notification { handle, value } => {
         iface
            .notification(address, handle, &hex::encode(value))
            .await
      },
      SessionEvent::SessionError(message) => iface.device_error(address, &message).await,
   }
}
