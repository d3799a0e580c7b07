//! # Karabo device runtime
//!
//! Devices are long-lived instances that describe themselves with a
//! [`Schema`](karabo_core::Schema), hold a validated configuration and talk
//! to each other through a message broker. Device servers host them; clients
//! drive them remotely.
//!
//! ## Crate Structure
//!
//! - **`broker`**: Message bus abstraction with an in-process and a TCP
//!   implementation, plus the broker status stream.
//! - **`signal_slot`**: The messaging endpoint every instance owns: slots,
//!   signals, request/reply, heartbeats and instance tracking.
//! - **`pipeline`**: Point-to-point data channels between devices with
//!   flow-control policies.
//! - **`device`**: The device base: property store, validation of updates,
//!   base slots, locking, alarms and persistence.
//! - **`devices`**: Device classes shipped with the runtime.
//! - **`server`**: The device server that instantiates and supervises devices.
//! - **`client`**: Remote control of servers and devices, and device proxies.
//! - **`config`**, **`logging`**, **`error`**: Ambient process plumbing.
//! - **`event_loop`**, **`frame`**: Task scheduling and the wire framing
//!   shared by TCP transports.
//!
//! The data model (`Hash`, `Schema`, validation, serialization) lives in the
//! `karabo-core` crate, re-exported here as [`karabo_core`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use karabo::args;
//! use karabo::broker::InprocBroker;
//! use karabo::config::ServerConfig;
//! use karabo::device::DeviceClasses;
//! use karabo::server::DeviceServer;
//!
//! # async fn demo() -> karabo::KaraboResult<()> {
//! let config = ServerConfig::load(None, &["serverId=S1".to_string()])?;
//! let broker = Arc::new(InprocBroker::new("inproc://demo", "karabo"));
//! let server = DeviceServer::new(&config, DeviceClasses::for_namespace("karabo.devices")?, broker);
//! server.start().await?;
//! server.endpoint().call("d1", "slotClearLock", args![]).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod device;
pub mod devices;
pub mod error;
pub mod event_loop;
pub mod frame;
pub mod logging;
pub mod pipeline;
pub mod server;
pub mod signal_slot;

pub use karabo_core;

pub use error::{KaraboError, KaraboResult};
