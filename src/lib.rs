//! # VXM Stage Driver
//!
//! Async driver for a three-axis motorized stage run by a Velmex VXM stepping
//! motor controller over RS-232. The controller speaks a terse ASCII protocol:
//! composite `E,C,...,R` programs for velocity and motion, single-letter
//! queries for position and readiness, and no acknowledgement of completion
//! other than answering `R` to a readiness poll.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: Pure command encoding and response decoding.
//! - **`units`**: Step / millimeter / inch conversion and the rounding rule.
//! - **`serial`**: The `Channel` contract and its serial-port implementation.
//! - **`axis`**: `AxisController`, readiness polling and the per-axis state machine.
//! - **`stage`**: `StageController`, owning the channel and all three axes.
//! - **`config`**: Figment-based configuration from TOML and environment.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`error`**: The `StageError` enum.
//! - **`mock_serial`**: Scripted in-memory controller for tests.

pub mod axis;
pub mod config;
pub mod error;
pub mod logging;
pub mod mock_serial;
pub mod protocol;
pub mod serial;
pub mod stage;
pub mod units;

pub use axis::{AxisController, AxisReading, AxisState, PollPolicy};
pub use config::StageConfig;
pub use error::{StageError, StageResult};
pub use protocol::{Axis, Position, ReadinessStatus, Velocity};
pub use stage::{StageController, StageSettings};
pub use units::Unit;
