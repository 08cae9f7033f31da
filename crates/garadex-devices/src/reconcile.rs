//! Reconciliation of cached door state against sensor reports.
//!
//! Status reports arrive from two places, the periodic poll and unsolicited
//! push notifications, and both reduce to a single boolean: the magnetic
//! sensor did not detect the door at the closed position. That flag is an
//! indirect proxy, not a true position, but it is still authoritative over
//! whatever the controller has optimistically assumed.

use crate::door::{DoorState, TargetState};

/// A correction produced by [`reconcile`].
///
/// `target` is `None` when only the current state needs adjusting (the
/// target already matches the observed outcome).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub target: Option<TargetState>,
    pub current: DoorState,
}

/// Resolve a sensor report against the cached current state.
///
/// Returns `None` when the report is consistent with the cache. Only
/// resting states are ever produced: the sensor can tell us where the door
/// ended up, never that it is moving.
///
/// The `Closing` rows are asymmetric on purpose: a close command is only
/// ever confirmed complete here. A reported-closed door while closing
/// leaves the target alone (it was already closed from the original
/// request), while a reported-open door means the door never actually
/// closed, so both target and current flip back to open.
///
/// `Stopped` is left untouched; a fresh explicit command is required to
/// drive the door out of the degraded state.
pub fn reconcile(sensor_open: bool, current: DoorState) -> Option<Reconciled> {
    match (current, sensor_open) {
        // Cache says open or opening
        (DoorState::Open | DoorState::Opening, true) => None,
        (DoorState::Open | DoorState::Opening, false) => Some(Reconciled {
            target: Some(TargetState::Closed),
            current: DoorState::Closed,
        }),

        // Cache says closed
        (DoorState::Closed, true) => Some(Reconciled {
            target: Some(TargetState::Open),
            current: DoorState::Open,
        }),
        (DoorState::Closed, false) => None,

        // Cache says closing
        (DoorState::Closing, true) => Some(Reconciled {
            target: Some(TargetState::Open),
            current: DoorState::Open,
        }),
        (DoorState::Closing, false) => Some(Reconciled {
            target: None,
            current: DoorState::Closed,
        }),

        // Degraded state: never auto-resolved by polling
        (DoorState::Stopped, _) => None,
    }
}
