//! Event types published on the Garadex event bus.
//!
//! Device controllers publish these whenever their cached door state
//! changes, whether through a user command, a status report or the
//! optimistic-completion timer. Subscribers (the CLI, automations) only
//! ever see the logical state, never the transport that produced it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted by device controllers.
///
/// States are carried as their lowercase labels (`open`, `closed`,
/// `opening`, `closing`, `stopped`) so subscribers do not need the
/// device crate's state type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GaradexEvent {
    /// The intended resting state changed.
    DeviceTarget {
        device_id: String,
        previous: String,
        state: String,
        timestamp: i64,
    },

    /// The known or assumed physical state changed.
    DeviceState {
        device_id: String,
        previous: String,
        state: String,
        timestamp: i64,
    },

    /// A command could not be delivered; the user-visible target has been
    /// (or will shortly be) reverted.
    DeviceFault {
        device_id: String,
        reason: String,
        timestamp: i64,
    },

    /// Outcome of an outbound device command.
    CommandResult {
        device_id: String,
        action: String,
        success: bool,
        detail: Option<String>,
        timestamp: i64,
    },
}

impl GaradexEvent {
    /// Get the device ID for this event.
    pub fn device_id(&self) -> &str {
        match self {
            Self::DeviceTarget { device_id, .. }
            | Self::DeviceState { device_id, .. }
            | Self::DeviceFault { device_id, .. }
            | Self::CommandResult { device_id, .. } => device_id,
        }
    }

    /// Get the timestamp for this event.
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::DeviceTarget { timestamp, .. }
            | Self::DeviceState { timestamp, .. }
            | Self::DeviceFault { timestamp, .. }
            | Self::CommandResult { timestamp, .. } => *timestamp,
        }
    }
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier
    pub id: Uuid,
    /// Component that published the event (e.g. "controller:garage-1")
    pub source: String,
    /// Publication time
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl EventMetadata {
    /// Create metadata for a new event.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_device_id() {
        let event = GaradexEvent::DeviceState {
            device_id: "garage-1".to_string(),
            previous: "opening".to_string(),
            state: "open".to_string(),
            timestamp: 0,
        };
        assert_eq!(event.device_id(), "garage-1");
    }

    #[test]
    fn test_event_serde_tagging() {
        let event = GaradexEvent::DeviceFault {
            device_id: "garage-1".to_string(),
            reason: "not responding".to_string(),
            timestamp: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "device_fault");
    }

    #[test]
    fn test_metadata_source() {
        let meta = EventMetadata::new("controller:garage-1");
        assert_eq!(meta.source, "controller:garage-1");
    }
}
