//! Device control core for the Garadex platform.
//!
//! ## Architecture
//!
//! - **GarageDoor**: per-device controller reconciling user commands,
//!   status polls and push notifications into one logical state
//! - **CommandQueue**: single-concurrency, interval-throttled channel every
//!   outbound instruction passes through
//! - **transition / reconcile**: the pure state-machine functions
//! - **Transport**: seam over the two delivery mechanisms (cloud MQTT,
//!   local HTTP), chosen once at controller construction
//!
//! The hard problem this crate solves is that the door's true position is
//! only known through a magnetic-sensor proxy, reported asynchronously
//! over channels that also echo our own commands back at us.

pub mod controller;
pub mod door;
pub mod error;
pub mod queue;
pub mod reconcile;
pub mod transport;

pub use controller::{GarageDoor, GarageDoorConfig};
pub use door::{transition, DoorAction, DoorState, TargetState, Transition};
pub use error::DeviceError;
pub use queue::{CommandQueue, QueueError};
pub use reconcile::{reconcile, Reconciled};
pub use transport::{
    CloudTransport, CloudTransportConfig, LocalTransport, LocalTransportConfig, PushNotification,
    StatusPayload, Transport, TransportKind,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
