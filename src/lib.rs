//! # zwave-driver
//!
//! A host-side driver for the Z-Wave Serial API: it speaks the framed
//! serial protocol to a Z-Wave controller chip over a byte transport,
//! schedules outbound traffic across prioritised queues with wake-up
//! semantics for battery nodes, drives every node through a multi-stage
//! interrogation pipeline, runs the network-management (inclusion,
//! exclusion, failed-node, return-route, virtual-button) state machines,
//! and surfaces all network activity as asynchronous notifications.
//!
//! What it deliberately does not do: interpret command-class semantics
//! beyond routing frames to pluggable handlers, manage application-level
//! values, or act as a slave device itself (beyond the virtual-node
//! bridging primitive).
//!
//! ## Architecture
//!
//! Two tokio tasks do the work. The **driver task** owns the transport:
//! it multiplexes over shutdown, inbound bytes, queue readiness and the
//! retry timer, runs the frame codec (SOF/ACK/NAK/CAN, XOR checksum) and
//! the single-transaction engine (expected callback id / expected reply
//! tracking, 2 s retry, drop after three attempts). The **poll task**
//! sweeps a rotating list of value ids, queueing refresh requests on the
//! lowest-priority queue. User-facing methods on [`driver::Driver`] run on
//! any thread and communicate through the queues.
//!
//! ## Example
//!
//! ```no_run
//! use zwave_driver::config::DriverOptions;
//! use zwave_driver::driver::Driver;
//! use zwave_driver::transport::SerialTransport;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = SerialTransport::new("/dev/ttyUSB0");
//!     let options = DriverOptions::new().user_path("/var/lib/zwave");
//!     let (driver, mut notifications) = Driver::start(transport, options);
//!
//!     while let Some(notification) = notifications.recv().await {
//!         println!("{notification:?}");
//!     }
//!
//!     driver.shutdown().await;
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command_class;
pub mod config;
pub mod controller;
pub mod core;
pub mod driver;
pub mod frame;
pub mod message;
pub mod node;
pub mod notification;
pub mod poll;
pub mod queue;
pub mod transport;

pub use crate::config::DriverOptions;
pub use crate::controller::{ControllerCallback, ControllerCommand, ControllerState};
pub use crate::core::error::{ConfigError, ControllerError, FrameError};
pub use driver::{ControllerIdentity, Driver, DriverStatistics};
pub use message::Message;
pub use node::query::QueryStage;
pub use node::NodeSummary;
pub use notification::{Notification, NotificationKind, Notifications};
pub use poll::ValueId;
pub use queue::SendQueue;
pub use transport::{SerialTransport, StreamTransport, Transport};
