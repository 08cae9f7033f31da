//! Garage door controller.
//!
//! One controller owns one physical device. It reconciles three
//! asynchronous sources of truth into the cached (`target`, `current`)
//! pair:
//!
//! - user commands, serialized through the per-device [`CommandQueue`]
//! - periodic status polls, also serialized through the queue
//! - unsolicited push notifications, which bypass the queue
//!
//! Every mutation of the session goes through the per-device session
//! mutex, so reconciliation can always land even while the queue is busy
//! with a command. A status report always wins over an optimistic
//! assumption.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures::{Stream, StreamExt};
use garadex_core::{EventBus, GaradexEvent};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::door::{transition, DoorAction, DoorState, TargetState};
use crate::error::DeviceError;
use crate::queue::CommandQueue;
use crate::reconcile::reconcile;
use crate::transport::{namespaces, PushNotification, Transport, TransportKind};

use garadex_core::defaults;

/// Per-device tunables.
#[derive(Debug, Clone)]
pub struct GarageDoorConfig {
    /// Identifier used in logs and published events.
    pub device_id: String,
    /// How long a full `open` is expected to take. Drives the
    /// optimistic-completion timer; never applied to closing.
    pub operation_time: Duration,
    /// Poll interval. Zero disables periodic polling (the startup poll
    /// still runs).
    pub poll_interval: Duration,
    /// Minimum spacing between command-queue unit starts.
    pub queue_interval: Duration,
    /// Hard bound on a single command-queue unit.
    pub queue_timeout: Duration,
    /// Quiet window after a self-issued cloud command during which push
    /// notifications are ignored.
    pub ignore_window: Duration,
    /// Delay before reverting the user-visible target after a failed
    /// command.
    pub revert_delay: Duration,
}

impl GarageDoorConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            operation_time: Duration::from_secs(defaults::OPERATION_TIME_SECS),
            poll_interval: Duration::from_secs(defaults::REFRESH_RATE_SECS),
            queue_interval: Duration::from_millis(defaults::QUEUE_INTERVAL_MS),
            queue_timeout: Duration::from_millis(defaults::QUEUE_TIMEOUT_MS),
            ignore_window: Duration::from_millis(defaults::IGNORE_WINDOW_MS),
            revert_delay: Duration::from_millis(defaults::REVERT_DELAY_MS),
        }
    }
}

/// Cached logical state for one device.
#[derive(Debug)]
struct DeviceSession {
    /// Last requested or reconciled resting goal.
    target: TargetState,
    /// Last known or assumed physical state.
    current: DoorState,
    /// Regenerated on each accepted open; a timer whose captured token no
    /// longer matches must no-op.
    pending_token: u64,
    /// End of the push echo-suppression window, if one is armed.
    ignore_until: Option<Instant>,
}

impl DeviceSession {
    fn new() -> Self {
        Self {
            target: TargetState::Closed,
            current: DoorState::Closed,
            pending_token: 0,
            ignore_until: None,
        }
    }

    fn ignore_window_active(&self) -> bool {
        self.ignore_until.is_some_and(|until| Instant::now() < until)
    }
}

struct Inner {
    config: GarageDoorConfig,
    session: Mutex<DeviceSession>,
    queue: CommandQueue,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Controller for one garage door. Cheap to clone; clones share the same
/// session, queue and transport.
#[derive(Clone)]
pub struct GarageDoor {
    inner: Arc<Inner>,
}

impl GarageDoor {
    /// Create a controller. The transport kind is fixed here for the
    /// lifetime of the device, not per call.
    pub fn new(config: GarageDoorConfig, transport: Arc<dyn Transport>, bus: EventBus) -> Self {
        let queue = CommandQueue::new(config.queue_interval, config.queue_timeout);
        Self {
            inner: Arc::new(Inner {
                config,
                session: Mutex::new(DeviceSession::new()),
                queue,
                transport,
                bus,
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.config.device_id
    }

    /// Last known or assumed physical state.
    pub async fn current(&self) -> DoorState {
        self.inner.session.lock().await.current
    }

    /// Last requested or reconciled resting goal.
    pub async fn target(&self) -> TargetState {
        self.inner.session.lock().await.target
    }

    /// Whether the command queue holds or is draining a unit of work.
    pub fn queue_busy(&self) -> bool {
        self.inner.queue.busy()
    }

    /// Request a new resting state.
    ///
    /// The request is queued behind any in-flight command or poll. On
    /// transport failure a fault event is published and, after a short
    /// delay, the user-visible target is reverted to its pre-request
    /// value unless a status report or newer command has settled the
    /// outcome first, so observers are never left with a silently wrong
    /// goal.
    pub async fn set_target(&self, requested: TargetState) -> Result<(), DeviceError> {
        let inner = self.inner.clone();
        let outcome = self
            .inner
            .queue
            .submit(async move { inner.apply_target(requested).await })
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(queue_err) => Err(DeviceError::from(queue_err)),
        };

        if let Err(err) = &result {
            warn!(
                device = %self.inner.config.device_id,
                error = %err,
                "sending update failed"
            );
            self.inner.bus.publish_with_source(
                GaradexEvent::DeviceFault {
                    device_id: self.inner.config.device_id.clone(),
                    reason: err.to_string(),
                    timestamp: chrono::Utc::now().timestamp(),
                },
                self.inner.source(),
            );
        }
        result
    }

    /// Poll the device for its status digest and reconcile.
    ///
    /// Skipped entirely while the queue is busy: a poll queued behind a
    /// pending command would only reread state that command is about to
    /// change.
    pub async fn request_update(&self) -> Result<(), DeviceError> {
        if self.inner.queue.busy() {
            return Ok(());
        }

        let inner = self.inner.clone();
        let outcome = self
            .inner
            .queue
            .submit(async move {
                let payload = inner.transport.request_status().await?;
                debug!(device = %inner.config.device_id, "incoming poll");
                let Some(sensor_open) = payload.poll_sensor_open() else {
                    return Err(DeviceError::MalformedResponse(
                        "status digest is missing the garage door reading".to_string(),
                    ));
                };
                inner.apply_report(sensor_open).await;
                Ok(())
            })
            .await;
        match outcome {
            Ok(result) => result,
            Err(queue_err) => Err(DeviceError::from(queue_err)),
        }
    }

    /// Entry point for unsolicited push notifications.
    ///
    /// Applies the same reconciliation as the poll path, but bypasses the
    /// queue so a busy command can never starve it. Notifications arriving
    /// inside the echo-suppression window are the transport re-delivering
    /// our own command and are dropped.
    pub async fn external_update(
        &self,
        notification: &PushNotification,
    ) -> Result<(), DeviceError> {
        if notification.namespace != namespaces::GARAGE_DOOR_STATE {
            return Ok(());
        }
        debug!(
            device = %self.inner.config.device_id,
            namespace = %notification.namespace,
            "incoming push notification"
        );

        {
            let session = self.inner.session.lock().await;
            if session.ignore_window_active() {
                debug!(
                    device = %self.inner.config.device_id,
                    "ignoring push echo of self-issued command"
                );
                return Ok(());
            }
        }

        let Some(sensor_open) = notification.payload.push_sensor_open() else {
            return Err(DeviceError::MalformedResponse(
                "push notification is missing the door state".to_string(),
            ));
        };
        self.inner.apply_report(sensor_open).await;
        Ok(())
    }

    /// Spawn the poll task: one update immediately, then one per interval.
    pub fn start_polling(&self) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = this.request_update().await {
                warn!(device = %this.inner.config.device_id, error = %e, "failed to refresh status");
            }
            let interval = this.inner.config.poll_interval;
            if interval.is_zero() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately and is already covered above.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = this.request_update().await {
                    warn!(device = %this.inner.config.device_id, error = %e, "failed to refresh status");
                }
            }
        });
        self.track(handle);
    }

    /// Spawn a task feeding a push-notification stream into
    /// [`external_update`].
    pub fn attach_push(
        &self,
        mut notifications: Pin<Box<dyn Stream<Item = PushNotification> + Send>>,
    ) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if let Err(e) = this.external_update(&notification).await {
                    warn!(
                        device = %this.inner.config.device_id,
                        error = %e,
                        "failed to apply push notification"
                    );
                }
            }
        });
        self.track(handle);
    }

    /// Stop the command queue and the poll and push tasks. Queued commands
    /// fail with a closed-queue error. Outstanding optimistic timers are
    /// not aborted; they self-cancel through the token check.
    pub fn shutdown(&self) {
        self.inner.queue.shutdown();
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(handle);
        }
    }
}

impl Inner {
    fn source(&self) -> String {
        format!("controller:{}", self.config.device_id)
    }

    /// Runs inside the command queue: compute the transition, apply the
    /// optimistic states, send the command if one is needed.
    async fn apply_target(self: Arc<Self>, requested: TargetState) -> Result<(), DeviceError> {
        let (step, previous_target, previous_current, token) = {
            let mut session = self.session.lock().await;
            let step = transition(requested, session.current);
            let previous_target = session.target;
            let previous_current = session.current;
            session.target = step.target;
            session.current = step.current;

            let mut token = session.pending_token;
            if step.action == Some(DoorAction::Open) {
                session.pending_token = session.pending_token.wrapping_add(1);
                token = session.pending_token;
            }

            // Arm the echo-suppression window before the command leaves:
            // the push transport can echo faster than the send returns.
            if step.action.is_some() && self.transport.kind() == TransportKind::Cloud {
                session.ignore_until = Some(Instant::now() + self.config.ignore_window);
            }
            (step, previous_target, previous_current, token)
        };

        self.announce_target(previous_target, step.target);
        self.announce_current(previous_current, step.current);

        let Some(action) = step.action else {
            return Ok(());
        };

        match self.transport.send_control(action == DoorAction::Open).await {
            Ok(()) => {
                self.bus.publish_with_source(
                    GaradexEvent::CommandResult {
                        device_id: self.config.device_id.clone(),
                        action: action.to_string(),
                        success: true,
                        detail: None,
                        timestamp: chrono::Utc::now().timestamp(),
                    },
                    self.source(),
                );
                // Opening completion is assumed after the operation time.
                // Closing completion is never assumed: a status report has
                // to confirm it, so an obstruction cannot hide behind an
                // optimistic success.
                if action == DoorAction::Open {
                    self.clone().arm_open_timer(token);
                }
                Ok(())
            }
            Err(err) => {
                self.bus.publish_with_source(
                    GaradexEvent::CommandResult {
                        device_id: self.config.device_id.clone(),
                        action: action.to_string(),
                        success: false,
                        detail: Some(err.to_string()),
                        timestamp: chrono::Utc::now().timestamp(),
                    },
                    self.source(),
                );
                self.clone()
                    .schedule_target_revert(previous_target, step.target);
                Err(err)
            }
        }
    }

    /// Schedule the opening → open transition, unless superseded.
    fn arm_open_timer(self: Arc<Self>, token: u64) {
        tokio::spawn(async move {
            tokio::time::sleep(self.config.operation_time).await;
            let mut session = self.session.lock().await;
            if session.pending_token != token {
                // A newer action superseded this timer.
                return;
            }
            if session.current != DoorState::Opening {
                // Already resolved by reconciliation.
                return;
            }
            let previous = session.current;
            session.current = DoorState::Open;
            drop(session);
            self.announce_current(previous, DoorState::Open);
        });
    }

    /// Revert the user-visible target after a failed command.
    ///
    /// Re-checks the session at fire time: a status report confirming a
    /// rest state, or a newer command, has already settled the question
    /// and the stale snapshot must not overwrite it.
    fn schedule_target_revert(self: Arc<Self>, previous: TargetState, optimistic: TargetState) {
        tokio::spawn(async move {
            tokio::time::sleep(self.config.revert_delay).await;
            let mut session = self.session.lock().await;
            if session.current.is_rest() {
                // Reconciliation confirmed an outcome in the meantime.
                return;
            }
            let from = session.target;
            if from != optimistic || from == previous {
                return;
            }
            session.target = previous;
            drop(session);
            info!(
                device = %self.config.device_id,
                from = %from,
                to = %previous,
                "reverting target after failed command"
            );
            self.bus.publish_with_source(
                GaradexEvent::DeviceTarget {
                    device_id: self.config.device_id.clone(),
                    previous: from.to_string(),
                    state: previous.to_string(),
                    timestamp: chrono::Utc::now().timestamp(),
                },
                self.source(),
            );
        });
    }

    /// Apply a sensor report; the authoritative correction path shared by
    /// polls and pushes.
    async fn apply_report(&self, sensor_open: bool) {
        let mut session = self.session.lock().await;
        let Some(correction) = reconcile(sensor_open, session.current) else {
            return;
        };
        let previous_target = session.target;
        let previous_current = session.current;
        if let Some(new_target) = correction.target {
            session.target = new_target;
        }
        session.current = correction.current;
        let new_target = session.target;
        drop(session);

        self.announce_target(previous_target, new_target);
        self.announce_current(previous_current, correction.current);
    }

    fn announce_target(&self, previous: TargetState, state: TargetState) {
        if previous == state {
            return;
        }
        info!(
            device = %self.config.device_id,
            from = %previous,
            to = %state,
            "target state"
        );
        self.bus.publish_with_source(
            GaradexEvent::DeviceTarget {
                device_id: self.config.device_id.clone(),
                previous: previous.to_string(),
                state: state.to_string(),
                timestamp: chrono::Utc::now().timestamp(),
            },
            self.source(),
        );
    }

    fn announce_current(&self, previous: DoorState, state: DoorState) {
        if previous == state {
            return;
        }
        info!(
            device = %self.config.device_id,
            from = %previous,
            to = %state,
            "current state"
        );
        self.bus.publish_with_source(
            GaradexEvent::DeviceState {
                device_id: self.config.device_id.clone(),
                previous: previous.to_string(),
                state: state.to_string(),
                timestamp: chrono::Utc::now().timestamp(),
            },
            self.source(),
        );
    }
}
