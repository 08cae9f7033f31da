//! End-to-end tests for the garage door controller.
//!
//! Exercises the complete flow against a scripted mock transport:
//! command acceptance, optimistic transitions, the completion timer,
//! reconciliation from polls and pushes, echo suppression and failure
//! revert. All tests run on paused time.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use garadex_core::{EventBus, GaradexEvent};
use garadex_devices::transport::namespaces;
use garadex_devices::{
    DeviceError, DoorState, GarageDoor, GarageDoorConfig, PushNotification, StatusPayload,
    TargetState, Transport, TransportKind,
};

/// Scripted transport: records control sends, serves a configurable
/// sensor reading, optionally fails or delays commands.
struct MockTransport {
    kind: TransportKind,
    sent: tokio::sync::Mutex<Vec<bool>>,
    sensor_open: AtomicBool,
    include_digest: AtomicBool,
    fail_commands: AtomicBool,
    command_delay_ms: AtomicU64,
    status_calls: AtomicUsize,
}

impl MockTransport {
    fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            sent: tokio::sync::Mutex::new(Vec::new()),
            sensor_open: AtomicBool::new(false),
            include_digest: AtomicBool::new(true),
            fail_commands: AtomicBool::new(false),
            command_delay_ms: AtomicU64::new(0),
            status_calls: AtomicUsize::new(0),
        })
    }

    async fn sent_commands(&self) -> Vec<bool> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send_control(&self, open: bool) -> Result<(), DeviceError> {
        let delay = self.command_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(DeviceError::CommandFailed(
                "device rejected command".to_string(),
            ));
        }
        self.sent.lock().await.push(open);
        Ok(())
    }

    async fn request_status(&self) -> Result<StatusPayload, DeviceError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if !self.include_digest.load(Ordering::SeqCst) {
            return Ok(StatusPayload::default());
        }
        let payload = serde_json::json!({
            "all": {
                "digest": {
                    "garageDoor": [
                        { "channel": 0, "open": self.sensor_open.load(Ordering::SeqCst) }
                    ]
                }
            }
        });
        serde_json::from_value(payload).map_err(DeviceError::from)
    }
}

fn push_report(sensor_open: bool) -> PushNotification {
    let payload = serde_json::json!({
        "state": [{ "channel": 0, "open": sensor_open }]
    });
    PushNotification {
        namespace: namespaces::GARAGE_DOOR_STATE.to_string(),
        payload: serde_json::from_value(payload).unwrap(),
    }
}

fn controller(transport: Arc<MockTransport>) -> GarageDoor {
    GarageDoor::new(
        GarageDoorConfig::new("garage-test"),
        transport,
        EventBus::new(),
    )
}

/// Let spawned tasks (queue worker, timers) run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_open_from_closed_completes_via_timer() {
    let transport = MockTransport::new(TransportKind::Local);
    let door = controller(transport.clone());

    door.set_target(TargetState::Open).await.unwrap();
    assert_eq!(door.current().await, DoorState::Opening);
    assert_eq!(door.target().await, TargetState::Open);
    assert_eq!(transport.sent_commands().await, vec![true]);

    // The optimistic timer flips opening to open after the operation time.
    tokio::time::advance(Duration::from_secs(16)).await;
    settle().await;
    assert_eq!(door.current().await, DoorState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_consistent_request_is_noop() {
    let transport = MockTransport::new(TransportKind::Local);
    let door = controller(transport.clone());

    // Door starts closed; asking for closed twice sends nothing.
    door.set_target(TargetState::Closed).await.unwrap();
    door.set_target(TargetState::Closed).await.unwrap();
    assert!(transport.sent_commands().await.is_empty());
    assert_eq!(door.current().await, DoorState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_reversal_mid_open_forces_target_closed() {
    let transport = MockTransport::new(TransportKind::Local);
    let door = controller(transport.clone());

    door.set_target(TargetState::Open).await.unwrap();
    assert_eq!(door.current().await, DoorState::Opening);

    // Reverse before the timer fires.
    door.set_target(TargetState::Closed).await.unwrap();
    assert_eq!(door.target().await, TargetState::Closed);
    assert_eq!(door.current().await, DoorState::Closing);
    assert_eq!(transport.sent_commands().await, vec![true, false]);

    // The open timer is now stale and must not resurrect the open state.
    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(door.current().await, DoorState::Closing);

    // Only a sensor report completes the close.
    door.external_update(&push_report(false)).await.unwrap();
    assert_eq!(door.current().await, DoorState::Closed);
    assert_eq!(door.target().await, TargetState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_superseded_timer_token_is_noop() {
    let transport = MockTransport::new(TransportKind::Local);
    let door = controller(transport.clone());

    // open (token A) -> close -> open (token B); both timers end up armed
    // while current is opening.
    door.set_target(TargetState::Open).await.unwrap();
    door.set_target(TargetState::Closed).await.unwrap();
    door.set_target(TargetState::Open).await.unwrap();
    assert_eq!(door.current().await, DoorState::Opening);

    // The queue spaces the three commands 250ms apart, so roughly half a
    // second has already elapsed. Advance past A's deadline but not B's:
    // A carries a stale token and must leave the state alone even though
    // current is opening.
    tokio::time::advance(Duration::from_millis(14_700)).await;
    settle().await;
    assert_eq!(door.current().await, DoorState::Opening);

    // B's deadline passes and completes the open.
    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(door.current().await, DoorState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_close_never_completes_by_elapsed_time() {
    let transport = MockTransport::new(TransportKind::Local);
    let door = controller(transport.clone());

    // Put the door at open via a sensor report.
    door.external_update(&push_report(true)).await.unwrap();
    assert_eq!(door.current().await, DoorState::Open);

    door.set_target(TargetState::Closed).await.unwrap();
    assert_eq!(door.current().await, DoorState::Closing);

    // No amount of elapsed time completes a close without confirmation.
    tokio::time::advance(Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(door.current().await, DoorState::Closing);

    door.external_update(&push_report(false)).await.unwrap();
    assert_eq!(door.current().await, DoorState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_poll_reconciles_external_open() {
    let transport = MockTransport::new(TransportKind::Local);
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let door = GarageDoor::new(
        GarageDoorConfig::new("garage-test"),
        transport.clone(),
        bus,
    );

    // Someone opened the door with the wall button; the poll sees it.
    transport.sensor_open.store(true, Ordering::SeqCst);
    door.request_update().await.unwrap();

    assert_eq!(door.current().await, DoorState::Open);
    assert_eq!(door.target().await, TargetState::Open);

    // Both the target and current corrections are published.
    let (first, _) = events.recv().await.unwrap();
    assert!(matches!(first, GaradexEvent::DeviceTarget { .. }));
    let (second, _) = events.recv().await.unwrap();
    assert!(matches!(second, GaradexEvent::DeviceState { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_push_echo_is_suppressed_for_cloud() {
    let transport = MockTransport::new(TransportKind::Cloud);
    let door = controller(transport.clone());

    door.set_target(TargetState::Open).await.unwrap();
    assert_eq!(door.current().await, DoorState::Opening);

    // The transport echoes our own command back within the quiet window;
    // it must not be mistaken for an external change.
    door.external_update(&push_report(false)).await.unwrap();
    assert_eq!(door.current().await, DoorState::Opening);

    // After the window the same report is a genuine external correction.
    tokio::time::advance(Duration::from_secs(4)).await;
    door.external_update(&push_report(false)).await.unwrap();
    assert_eq!(door.current().await, DoorState::Closed);
    assert_eq!(door.target().await, TargetState::Closed);

    // The now-stale open timer cannot undo the reconciliation.
    tokio::time::advance(Duration::from_secs(20)).await;
    settle().await;
    assert_eq!(door.current().await, DoorState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_command_reverts_target() {
    let transport = MockTransport::new(TransportKind::Local);
    transport.fail_commands.store(true, Ordering::SeqCst);
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let door = GarageDoor::new(
        GarageDoorConfig::new("garage-test"),
        transport.clone(),
        bus,
    );

    let result = door.set_target(TargetState::Open).await;
    assert!(matches!(result, Err(DeviceError::CommandFailed(_))));

    // The optimistic target sticks briefly, then reverts. The yield lets
    // the revert task register its deadline before time moves.
    assert_eq!(door.target().await, TargetState::Open);
    settle().await;
    tokio::time::advance(Duration::from_secs(3)).await;
    settle().await;
    assert_eq!(door.target().await, TargetState::Closed);

    let mut saw_fault = false;
    while let Some((event, _)) = events.try_recv() {
        if matches!(event, GaradexEvent::DeviceFault { .. }) {
            saw_fault = true;
        }
    }
    assert!(saw_fault, "expected a fault event after the failed command");
}

#[tokio::test(start_paused = true)]
async fn test_revert_defers_to_confirmed_outcome() {
    let transport = MockTransport::new(TransportKind::Local);
    let door = controller(transport.clone());

    // Door resting open.
    door.external_update(&push_report(true)).await.unwrap();
    assert_eq!(door.current().await, DoorState::Open);

    // The close command fails, but the door closes anyway and the sensor
    // confirms it before the revert deadline.
    transport.fail_commands.store(true, Ordering::SeqCst);
    let result = door.set_target(TargetState::Closed).await;
    assert!(matches!(result, Err(DeviceError::CommandFailed(_))));
    settle().await;

    tokio::time::advance(Duration::from_millis(500)).await;
    door.external_update(&push_report(false)).await.unwrap();
    assert_eq!(door.current().await, DoorState::Closed);
    assert_eq!(door.target().await, TargetState::Closed);

    // The revert must not overwrite the sensor-confirmed target.
    tokio::time::advance(Duration::from_secs(3)).await;
    settle().await;
    assert_eq!(door.target().await, TargetState::Closed);
    assert_eq!(door.current().await, DoorState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_poll_surfaces_error() {
    let transport = MockTransport::new(TransportKind::Local);
    transport.include_digest.store(false, Ordering::SeqCst);
    let door = controller(transport.clone());

    let result = door.request_update().await;
    assert!(matches!(result, Err(DeviceError::MalformedResponse(_))));
    // State is untouched by a malformed poll.
    assert_eq!(door.current().await, DoorState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_poll_is_skipped_while_queue_busy() {
    let transport = MockTransport::new(TransportKind::Local);
    transport.command_delay_ms.store(500, Ordering::SeqCst);
    let door = controller(transport.clone());

    // A slow command occupies the queue.
    let busy_door = door.clone();
    let command = tokio::spawn(async move { busy_door.set_target(TargetState::Open).await });
    settle().await;
    assert!(door.queue_busy());

    // The poll declines instead of piling up behind the command.
    door.request_update().await.unwrap();
    assert_eq!(transport.status_calls.load(Ordering::SeqCst), 0);

    command.await.unwrap().unwrap();
    assert!(!door.queue_busy());
}

#[tokio::test(start_paused = true)]
async fn test_foreign_namespace_push_is_ignored() {
    let transport = MockTransport::new(TransportKind::Local);
    let door = controller(transport.clone());

    let notification = PushNotification {
        namespace: "Appliance.System.Online".to_string(),
        payload: StatusPayload::default(),
    };
    door.external_update(&notification).await.unwrap();
    assert_eq!(door.current().await, DoorState::Closed);
}
