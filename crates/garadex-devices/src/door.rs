//! Door state model and the pure transition function.
//!
//! The transition function decides, from a requested resting state and the
//! cached current state, which command (if any) to send and which
//! provisional states to assume while the door moves. It never produces
//! `Stopped`; that state is only ever observed through reconciliation.

use serde::{Deserialize, Serialize};

/// Physical door state.
///
/// `Stopped` is reported by the device (motion interrupted mid-travel),
/// never computed by [`transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorState {
    Open,
    Closed,
    Opening,
    Closing,
    Stopped,
}

impl DoorState {
    /// Whether this is a resting state (`open` or `closed`).
    pub fn is_rest(self) -> bool {
        matches!(self, Self::Open | Self::Closed)
    }
}

impl std::fmt::Display for DoorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Opening => write!(f, "opening"),
            Self::Closing => write!(f, "closing"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// The resting state a user or automation can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Open,
    Closed,
}

impl TargetState {
    /// The equivalent physical state.
    pub fn door_state(self) -> DoorState {
        match self {
            Self::Open => DoorState::Open,
            Self::Closed => DoorState::Closed,
        }
    }
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Command to send to the physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorAction {
    Open,
    Close,
}

impl std::fmt::Display for DoorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// Outcome of [`transition`]: the command to send (if any) and the
/// provisional states to cache while it executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub action: Option<DoorAction>,
    pub target: TargetState,
    pub current: DoorState,
}

/// Compute the action and provisional states for a target-state request.
///
/// Requests consistent with in-flight motion are no-ops. Requests contrary
/// to in-flight motion reverse the door and force the target to match the
/// action actually taken, so observers are never left inconsistent.
///
/// A request while the door is `Stopped` resumes normal operation: the door
/// has to be driven out of the degraded state by an explicit command, it is
/// never auto-resolved here or by polling.
pub fn transition(requested: TargetState, current: DoorState) -> Transition {
    match (requested, current) {
        // Close requests
        (TargetState::Closed, DoorState::Open) => Transition {
            action: Some(DoorAction::Close),
            target: TargetState::Closed,
            current: DoorState::Closing,
        },
        (TargetState::Closed, DoorState::Closed) => Transition {
            action: None,
            target: TargetState::Closed,
            current: DoorState::Closed,
        },
        // Mid-open reversal: the target is forced to closed to match the
        // command actually sent.
        (TargetState::Closed, DoorState::Opening) => Transition {
            action: Some(DoorAction::Close),
            target: TargetState::Closed,
            current: DoorState::Closing,
        },
        (TargetState::Closed, DoorState::Closing) => Transition {
            action: None,
            target: TargetState::Closed,
            current: DoorState::Closing,
        },
        (TargetState::Closed, DoorState::Stopped) => Transition {
            action: Some(DoorAction::Close),
            target: TargetState::Closed,
            current: DoorState::Closing,
        },

        // Open requests
        (TargetState::Open, DoorState::Open) => Transition {
            action: None,
            target: TargetState::Open,
            current: DoorState::Open,
        },
        (TargetState::Open, DoorState::Closed) => Transition {
            action: Some(DoorAction::Open),
            target: TargetState::Open,
            current: DoorState::Opening,
        },
        (TargetState::Open, DoorState::Opening) => Transition {
            action: None,
            target: TargetState::Open,
            current: DoorState::Opening,
        },
        // Mid-close reversal
        (TargetState::Open, DoorState::Closing) => Transition {
            action: Some(DoorAction::Open),
            target: TargetState::Open,
            current: DoorState::Opening,
        },
        (TargetState::Open, DoorState::Stopped) => Transition {
            action: Some(DoorAction::Open),
            target: TargetState::Open,
            current: DoorState::Opening,
        },
    }
}
