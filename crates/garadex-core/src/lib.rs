//! Shared core for the Garadex platform.
//!
//! This crate carries the pieces every other crate leans on:
//! - **EventBus**: broadcast channel distributing device events
//! - **GaradexEvent**: the event vocabulary published by device controllers
//! - **defaults**: platform-wide default values (poll rates, timeouts)

pub mod config;
pub mod event;
pub mod eventbus;

pub use config::defaults;
pub use event::{EventMetadata, GaradexEvent};
pub use eventbus::{EventBus, EventBusReceiver};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
