//! Single-axis motion control.
//!
//! An [`AxisController`] drives one motor of the VXM through the stage's
//! shared channel. Every operation walks a small state machine and always
//! lands back in [`AxisState::Idle`], including when it fails or when its
//! future is dropped mid-flight:
//!
//! ```text
//! Idle ──set_velocity──▶ AwaitingVelocityAck ──write done──▶ Idle
//! Idle ──move──▶ Moving ──write done──▶ AwaitingReadiness ──`R`──▶ Idle
//! ```
//!
//! Motion completion is detected by polling `V` until the controller answers
//! `R`. By default the wait is unbounded, matching the controller's own
//! behaviour; a [`PollPolicy`] with `max_attempts` or `deadline` turns it into
//! a bounded wait that fails with [`StageError::NotReady`].

use crate::error::{StageError, StageResult};
use crate::protocol::{
    decode_position, decode_readiness, encode_readiness_query, encode_relative_move,
    encode_velocity, encode_zero, encode_position_query, Axis, Command, Position,
    ReadinessStatus, Velocity,
};
use crate::serial::SharedChannel;
use crate::units::{self, Unit};
use std::fmt;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::instrument;

/// Delay between readiness polls unless configured otherwise.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-read timeout unless configured otherwise.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Where an axis is in its current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisState {
    /// No operation outstanding.
    Idle,
    /// Velocity command being written.
    AwaitingVelocityAck,
    /// Motion command being written.
    Moving,
    /// Motion command sent, polling for `R`.
    AwaitingReadiness,
}

/// How long to keep polling for readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between consecutive readiness queries.
    pub interval: Duration,
    /// Give up after this many queries. `None` polls forever.
    pub max_attempts: Option<u32>,
    /// Give up once this much time has passed. `None` waits forever.
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::unbounded(DEFAULT_POLL_INTERVAL)
    }
}

impl PollPolicy {
    /// Poll until ready with no limit.
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            deadline: None,
        }
    }

    /// Limit the number of readiness queries.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Limit the total wait.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn exhausted(&self, attempts: u32, started: Instant) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
            || self.deadline.is_some_and(|d| started.elapsed() >= d)
    }
}

/// One position reading: the raw step count and its value in a unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisReading {
    /// Axis the reading belongs to.
    pub axis: Axis,
    /// Raw steps from the zero reference.
    pub steps: i64,
    /// `steps` expressed in `unit`.
    pub value: f64,
    /// Unit of `value`.
    pub unit: Unit,
}

impl AxisReading {
    fn new(axis: Axis, position: Position, unit: Unit) -> Self {
        Self {
            axis,
            steps: position.steps(),
            value: units::steps_to(position.steps(), unit),
            unit,
        }
    }
}

impl fmt::Display for AxisReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Position: {:.6}{}", self.axis, self.value, self.unit)
    }
}

/// Resets the axis to `Idle` when the operation ends, however it ends.
struct StateGuard<'a> {
    state: &'a watch::Sender<AxisState>,
}

impl<'a> StateGuard<'a> {
    fn enter(state: &'a watch::Sender<AxisState>, next: AxisState) -> Self {
        state.send_replace(next);
        Self { state }
    }

    fn advance(&self, next: AxisState) {
        self.state.send_replace(next);
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.state.send_replace(AxisState::Idle);
    }
}

/// Controller for one logical axis of the stage.
pub struct AxisController {
    axis: Axis,
    /// Channel slot shared with the other axes of the stage
    channel: SharedChannel,
    /// Per-read timeout
    read_timeout: Duration,
    /// Readiness wait used by moves
    poll: PollPolicy,
    state: watch::Sender<AxisState>,
    /// One outstanding operation per axis
    op_lock: Mutex<()>,
}

impl AxisController {
    /// Create a controller for `axis` on an existing channel.
    pub fn new(axis: Axis, channel: SharedChannel, read_timeout: Duration, poll: PollPolicy) -> Self {
        let (state, _) = watch::channel(AxisState::Idle);
        Self {
            axis,
            channel,
            read_timeout,
            poll,
            state,
            op_lock: Mutex::new(()),
        }
    }

    /// The axis this controller drives.
    pub fn axis(&self) -> Axis {
        self.axis
    }

    /// Current state.
    pub fn state(&self) -> AxisState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<AxisState> {
        self.state.subscribe()
    }

    /// Readiness policy applied to moves.
    pub fn poll_policy(&self) -> PollPolicy {
        self.poll
    }

    /// Configure the motor speed in steps/second.
    ///
    /// The controller does not acknowledge this command, so success means the
    /// line was written. Out-of-range speeds are rejected before any write.
    #[instrument(skip(self), fields(axis = %self.axis), err)]
    pub async fn set_velocity(&self, speed: i64) -> StageResult<()> {
        let velocity = Velocity::new(speed)?;
        let _op = self.op_lock.lock().await;
        let _state = StateGuard::enter(&self.state, AxisState::AwaitingVelocityAck);

        self.send(&encode_velocity(self.axis, velocity)).await?;
        tracing::info!("Velocity of axis {} set to {} steps/s", self.axis, velocity);
        Ok(())
    }

    /// Return to the stored zero reference and wait until the controller is ready.
    #[instrument(skip(self), fields(axis = %self.axis), err)]
    pub async fn move_to_zero(&self) -> StageResult<()> {
        self.run_motion(encode_zero(self.axis)).await
    }

    /// Move by `distance` in `unit` and wait until the controller is ready.
    ///
    /// The distance is rounded to whole steps (half away from zero). Returns
    /// the step count actually commanded.
    #[instrument(skip(self), fields(axis = %self.axis), err)]
    pub async fn move_relative(&self, distance: f64, unit: Unit) -> StageResult<i64> {
        if !distance.is_finite() {
            return Err(StageError::InvalidDistance(distance));
        }
        let steps = units::to_steps(distance, unit);
        self.move_steps(steps).await?;
        Ok(steps)
    }

    /// Move by a raw step count and wait until the controller is ready.
    #[instrument(skip(self), fields(axis = %self.axis), err)]
    pub async fn move_steps(&self, steps: i64) -> StageResult<()> {
        self.run_motion(encode_relative_move(self.axis, steps)).await
    }

    /// Query the position once, returning raw steps and the value in `unit`.
    #[instrument(skip(self), fields(axis = %self.axis), err)]
    pub async fn query_position(&self, unit: Unit) -> StageResult<AxisReading> {
        let _op = self.op_lock.lock().await;

        let line = self.transact(&encode_position_query(self.axis)).await?;
        let reading = AxisReading::new(self.axis, decode_position(&line)?, unit);
        tracing::info!("{}", reading);
        Ok(reading)
    }

    /// Poll `V` until the controller reports ready, under `policy`.
    ///
    /// Busy, jog, unknown and timed-out replies are all reasons to wait again.
    /// Returns the number of readiness queries sent.
    #[instrument(skip(self), fields(axis = %self.axis), err)]
    pub async fn poll_until_ready(&self, policy: PollPolicy) -> StageResult<u32> {
        let _op = self.op_lock.lock().await;
        let _state = StateGuard::enter(&self.state, AxisState::AwaitingReadiness);
        self.wait_ready(&policy).await
    }

    async fn run_motion(&self, command: Command) -> StageResult<()> {
        let _op = self.op_lock.lock().await;
        let state = StateGuard::enter(&self.state, AxisState::Moving);

        self.send(&command).await?;
        state.advance(AxisState::AwaitingReadiness);
        let attempts = self.wait_ready(&self.poll).await?;
        tracing::debug!(attempts, "Motion complete");
        Ok(())
    }

    async fn wait_ready(&self, policy: &PollPolicy) -> StageResult<u32> {
        let query = encode_readiness_query();
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut last: Option<ReadinessStatus> = None;

        // Always at least one query, whatever the bounds
        loop {
            attempts += 1;
            match self.transact(&query).await {
                Ok(line) => {
                    let status = decode_readiness(&line);
                    last = Some(status);
                    if status.is_ready() {
                        return Ok(attempts);
                    }
                    if status == ReadinessStatus::Unknown {
                        tracing::warn!(response = %line, "Unrecognized readiness reply");
                    } else {
                        tracing::trace!(?status, "Controller not ready");
                    }
                }
                Err(StageError::Timeout(_)) => {
                    tracing::trace!(attempts, "No readiness reply yet");
                }
                Err(e) => return Err(e),
            }

            if policy.exhausted(attempts, started) {
                tracing::warn!(attempts, ?last, "Gave up waiting for readiness");
                return Err(StageError::NotReady { attempts, last });
            }

            tokio::time::sleep(policy.interval).await;
        }
    }

    /// Write without reading a reply.
    async fn send(&self, command: &Command) -> StageResult<()> {
        let mut slot = self.channel.lock().await;
        let channel = slot.as_mut().ok_or(StageError::ChannelClosed)?;
        channel.write_line(command.as_str()).await
    }

    /// Write and read one reply while holding the channel.
    async fn transact(&self, command: &Command) -> StageResult<String> {
        let mut slot = self.channel.lock().await;
        let channel = slot.as_mut().ok_or(StageError::ChannelClosed)?;
        channel.write_line(command.as_str()).await?;
        channel.read_line(self.read_timeout).await
    }
}
