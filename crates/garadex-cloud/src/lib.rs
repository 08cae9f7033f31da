//! Cloud account access for garadex.
//!
//! Provides the signed HTTP session used to authenticate an account,
//! enumerate its devices and look up hub sub-devices. The MQTT
//! transport in `garadex-devices` derives its broker credentials from
//! the [`Credentials`] produced here.

pub mod error;
pub mod session;
pub mod sign;

pub use error::{CloudError, CloudResult};
pub use session::{CloudSession, Credentials, DeviceRecord, SubDeviceRecord};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
