//! Three-axis stage controller.
//!
//! [`StageController`] owns the one channel to the VXM and an
//! [`AxisController`] per motor. Whole-stage operations always visit the axes
//! in X, Y, Z order and never overlap: the rig's axes interfere mechanically
//! if moved together, and the controller protocol cannot attribute replies to
//! anything but the last command sent.
//!
//! # Example Usage
//!
//! ```ignore
//! use vxm_stage::config::StageConfig;
//! use vxm_stage::stage::StageController;
//! use vxm_stage::units::Unit;
//! use vxm_stage::protocol::Axis;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StageConfig::load_from("config/vxm.toml")?;
//!     let stage = StageController::connect(&config).await?;
//!
//!     stage.home_all().await?;
//!     stage.move_relative(Axis::X, 1.0, Unit::Inches).await?;
//!     let (x, y, z) = stage.query_all_positions(Unit::Millimeters).await?;
//!     println!("X={x:.3}mm Y={y:.3}mm Z={z:.3}mm");
//!
//!     stage.close().await?;
//!     Ok(())
//! }
//! ```

use crate::axis::{AxisController, AxisReading, PollPolicy, DEFAULT_READ_TIMEOUT};
use crate::error::{StageError, StageResult};
use crate::protocol::{Axis, Velocity};
use crate::serial::{wrap_shared, Channel, DynSerial, SerialChannel, SharedChannel};
use crate::units::Unit;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;

/// Pause between homing consecutive axes unless configured otherwise.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Timing and start-up parameters for a stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageSettings {
    /// Per-read channel timeout.
    pub read_timeout: Duration,
    /// Pause between homing consecutive axes.
    pub settle_delay: Duration,
    /// Readiness wait applied to every move.
    pub poll: PollPolicy,
    /// Velocity written to every axis by [`StageController::initialize`].
    pub default_velocity: Velocity,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            poll: PollPolicy::default(),
            default_velocity: Velocity::default(),
        }
    }
}

/// Controller for the whole X/Y/Z stage.
pub struct StageController {
    channel: SharedChannel,
    axes: [AxisController; 3],
    settings: StageSettings,
    /// Keeps whole-stage sequences from interleaving
    sequence: Mutex<()>,
}

impl StageController {
    /// Build a stage on an already open channel. Sends nothing.
    pub fn new(channel: Box<dyn Channel>, settings: StageSettings) -> Self {
        let channel = wrap_shared(channel);
        let axes = Axis::ALL.map(|axis| {
            AxisController::new(axis, channel.clone(), settings.read_timeout, settings.poll)
        });

        Self {
            channel,
            axes,
            settings,
            sequence: Mutex::new(()),
        }
    }

    /// Build a stage directly on a byte stream.
    pub fn with_port(port: DynSerial, settings: StageSettings) -> Self {
        Self::new(Box::new(SerialChannel::new(port)), settings)
    }

    /// Open the configured serial port, build the stage and run [`Self::initialize`].
    ///
    /// # Errors
    /// Returns error if the port cannot be opened or the velocity commands fail.
    #[cfg(feature = "serial")]
    pub async fn connect(config: &crate::config::StageConfig) -> StageResult<Self> {
        let port = crate::serial::open_serial_async(
            &config.connection.port,
            config.connection.baud_rate,
            "VXM",
        )
        .await?;

        tracing::info!("Initializing stage on port: {}", config.connection.port);
        let stage = Self::with_port(Box::new(port), config.to_settings()?);
        stage.initialize().await?;
        Ok(stage)
    }

    /// Write the default velocity to X, Y and Z.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self) -> StageResult<()> {
        self.set_velocity_all(i64::from(self.settings.default_velocity.get()))
            .await
    }

    /// Settings this stage was built with.
    pub fn settings(&self) -> &StageSettings {
        &self.settings
    }

    /// Borrow the controller for one axis.
    pub fn axis(&self, axis: Axis) -> &AxisController {
        match axis {
            Axis::X => &self.axes[0],
            Axis::Y => &self.axes[1],
            Axis::Z => &self.axes[2],
        }
    }

    /// Set the same velocity on every axis, X first.
    #[instrument(skip(self), err)]
    pub async fn set_velocity_all(&self, speed: i64) -> StageResult<()> {
        Velocity::new(speed)?;
        let _seq = self.sequence.lock().await;
        for axis in &self.axes {
            axis.set_velocity(speed).await?;
        }
        Ok(())
    }

    /// Return X, then Y, then Z to zero, pausing `settle_delay` between axes.
    #[instrument(skip(self), err)]
    pub async fn home_all(&self) -> StageResult<()> {
        let _seq = self.sequence.lock().await;
        for (i, axis) in self.axes.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.settle_delay).await;
            }
            axis.move_to_zero().await?;
            tracing::info!("Axis {} homed", axis.axis());
        }
        Ok(())
    }

    /// Relative move on one axis. Returns the step count commanded.
    pub async fn move_relative(&self, axis: Axis, distance: f64, unit: Unit) -> StageResult<i64> {
        let _seq = self.sequence.lock().await;
        self.axis(axis).move_relative(distance, unit).await
    }

    /// Query one axis.
    pub async fn query_position(&self, axis: Axis, unit: Unit) -> StageResult<AxisReading> {
        let _seq = self.sequence.lock().await;
        self.axis(axis).query_position(unit).await
    }

    /// Query X, Y and Z in that order, returning their values in `unit`.
    #[instrument(skip(self), err)]
    pub async fn query_all_positions(&self, unit: Unit) -> StageResult<(f64, f64, f64)> {
        let _seq = self.sequence.lock().await;
        let x = self.axes[0].query_position(unit).await?;
        let y = self.axes[1].query_position(unit).await?;
        let z = self.axes[2].query_position(unit).await?;

        tracing::info!(
            "Stage Positions: X={:.6}{unit} Y={:.6}{unit} Z={:.6}{unit}",
            x.value,
            y.value,
            z.value
        );
        Ok((x.value, y.value, z.value))
    }

    /// Whether the channel has been released.
    pub async fn is_closed(&self) -> bool {
        self.channel.lock().await.is_none()
    }

    /// Release the channel. Safe to call more than once.
    ///
    /// A move still polling for readiness fails with
    /// [`StageError::ChannelClosed`] on its next query, which is the only way
    /// to abandon a move: the protocol has no stop command.
    pub async fn close(&self) -> StageResult<()> {
        let mut slot = self.channel.lock().await;
        let Some(mut channel) = slot.take() else {
            return Ok(());
        };

        tracing::info!("Releasing stage channel");
        match channel.close().await {
            Ok(()) | Err(StageError::ChannelClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for StageController {
    fn drop(&mut self) {
        // Dropping the channel closes the port; an in-flight exchange keeps
        // the lock, in which case the last Arc holder drops it instead.
        if let Ok(mut slot) = self.channel.try_lock() {
            if slot.take().is_some() {
                tracing::debug!("Stage channel released on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial::{self, MockDeviceHarness};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn stage(settle: Duration) -> (Arc<StageController>, MockDeviceHarness) {
        let (port, harness) = mock_serial::new();
        let settings = StageSettings {
            read_timeout: Duration::from_millis(200),
            settle_delay: settle,
            poll: PollPolicy::unbounded(Duration::from_millis(1)),
            default_velocity: Velocity::default(),
        };
        (Arc::new(StageController::with_port(Box::new(port), settings)), harness)
    }

    #[tokio::test]
    async fn every_axis_shares_the_stage_poll_policy() {
        let (port, _harness) = mock_serial::new();
        let settings = StageSettings {
            poll: PollPolicy::unbounded(Duration::from_millis(5)).with_max_attempts(20),
            ..StageSettings::default()
        };
        let stage = StageController::with_port(Box::new(port), settings);

        assert_eq!(stage.settings(), &settings);
        for axis in Axis::ALL {
            assert_eq!(stage.axis(axis).axis(), axis);
            assert_eq!(stage.axis(axis).poll_policy(), stage.settings().poll);
        }
    }

    #[tokio::test]
    async fn initialize_sets_default_velocity_in_order() {
        let (stage, mut harness) = stage(Duration::ZERO);

        stage.initialize().await.unwrap();

        harness.expect_command("E,C,S1M2000,R").await;
        harness.expect_command("E,C,S2M2000,R").await;
        harness.expect_command("E,C,S3M2000,R").await;
        harness.assert_no_writes();
    }

    #[tokio::test]
    async fn invalid_velocity_for_all_axes_sends_nothing() {
        let (stage, mut harness) = stage(Duration::ZERO);

        assert!(matches!(
            stage.set_velocity_all(6001).await,
            Err(StageError::InvalidVelocity(6001))
        ));
        harness.assert_no_writes();
    }

    #[tokio::test]
    async fn home_all_visits_axes_in_order_with_settle_delay() {
        let settle = Duration::from_millis(40);
        let (stage, mut harness) = stage(settle);

        let started = Instant::now();
        let task = tokio::spawn({
            let stage = stage.clone();
            async move { stage.home_all().await }
        });

        harness.expect_command("E,C,IA1M0,R").await;
        harness.expect_and_respond("V", "R").await;
        harness.expect_command("E,C,IA2M0,R").await;
        harness.expect_and_respond("V", "R").await;
        harness.expect_command("E,C,IA3M0,R").await;
        harness.expect_and_respond("V", "R").await;

        task.await.unwrap().unwrap();
        assert!(started.elapsed() >= settle * 2);
    }

    #[tokio::test]
    async fn query_all_positions_uses_25_4_for_every_axis() {
        let (stage, mut harness) = stage(Duration::ZERO);

        let task = tokio::spawn({
            let stage = stage.clone();
            async move { stage.query_all_positions(Unit::Inches).await }
        });

        harness.expect_and_respond("X", "X+0005080").await;
        harness.expect_and_respond("Y", "Y+0005080").await;
        harness.expect_and_respond("Z", "Z-0002540").await;

        let (x, y, z) = task.await.unwrap().unwrap();
        assert!((x - 1.0).abs() < 1e-9);
        assert!((y - 1.0).abs() < 1e-9);
        assert!((z + 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_operations() {
        let (stage, mut harness) = stage(Duration::ZERO);

        stage.close().await.unwrap();
        stage.close().await.unwrap();
        assert!(stage.is_closed().await);

        assert!(matches!(stage.home_all().await, Err(StageError::ChannelClosed)));
        assert!(matches!(
            stage.query_all_positions(Unit::Millimeters).await,
            Err(StageError::ChannelClosed)
        ));
        assert!(matches!(
            stage.move_relative(Axis::Y, 1.0, Unit::Millimeters).await,
            Err(StageError::ChannelClosed)
        ));
        harness.assert_no_writes();
    }

    #[tokio::test]
    async fn close_aborts_a_pending_move() {
        let (stage, mut harness) = stage(Duration::ZERO);

        let task = tokio::spawn({
            let stage = stage.clone();
            async move { stage.move_relative(Axis::X, 10.0, Unit::Millimeters).await }
        });

        harness.expect_command("E,C,I1M2000,R").await;
        harness.expect_and_respond("V", "B").await;
        stage.close().await.unwrap();

        assert!(matches!(task.await.unwrap(), Err(StageError::ChannelClosed)));
        assert_eq!(stage.axis(Axis::X).state(), crate::axis::AxisState::Idle);
    }
}
