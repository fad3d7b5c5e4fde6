//! Velmex VXM wire protocol.
//!
//! Reference: VXM Stepping Motor Controller User's Manual
//!
//! Protocol Overview:
//! - Format: ASCII over RS-232, commands terminated by `\r`, responses by `\n`
//! - Baud: 9600, 8N1, no flow control
//! - Motion/config commands: `E,C,<op><motor><M><value>,R`
//!   (`E` on-line mode, `C` clear program, `R` run)
//! - Immediate queries: `X`/`Y`/`Z` (motor position), `V` (readiness)
//!
//! | Operation | Command | Response |
//! |---|---|---|
//! | Set velocity | `E,C,S1M2000,R` | none |
//! | Move to zero | `E,C,IA1M0,R` | none (poll `V`) |
//! | Relative move | `E,C,I1M-400,R` | none (poll `V`) |
//! | Position | `X` | `X+0012345` |
//! | Readiness | `V` | `R`, `B`, `J`, `b` |
//!
//! Everything in this module is pure: no I/O, no clocks.

use crate::error::{StageError, StageResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Highest velocity the controller accepts, in steps/second.
pub const MAX_VELOCITY: u32 = 6000;

/// Velocity configured on every axis at start-up.
pub const DEFAULT_VELOCITY: u32 = 2000;

/// Fixed length of a position response: axis, sign, seven digits.
pub const POSITION_RESPONSE_LEN: usize = 9;

/// One of the three linear motion channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Motor 1.
    X,
    /// Motor 2.
    Y,
    /// Motor 3.
    Z,
}

impl Axis {
    /// All axes in homing/query order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Controller motor number used inside composite commands.
    pub fn motor_index(self) -> u8 {
        match self {
            Axis::X => 1,
            Axis::Y => 2,
            Axis::Z => 3,
        }
    }

    /// Letter used for the immediate position query.
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "X" | "x" | "1" => Ok(Axis::X),
            "Y" | "y" | "2" => Ok(Axis::Y),
            "Z" | "z" | "3" => Ok(Axis::Z),
            other => Err(format!("Invalid axis '{}'. Must be X, Y or Z", other)),
        }
    }
}

/// Motor speed in steps/second, guaranteed to lie in (0, 6000].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Velocity(u32);

impl Velocity {
    /// Validate a requested speed.
    pub fn new(steps_per_sec: i64) -> StageResult<Self> {
        if steps_per_sec > 0 && steps_per_sec <= i64::from(MAX_VELOCITY) {
            Ok(Velocity(steps_per_sec as u32))
        } else {
            Err(StageError::InvalidVelocity(steps_per_sec))
        }
    }

    /// Speed in steps/second.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for Velocity {
    fn default() -> Self {
        Velocity(DEFAULT_VELOCITY)
    }
}

impl fmt::Display for Velocity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signed step count from the controller's zero reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position(pub i64);

impl Position {
    /// Raw step count.
    pub fn steps(self) -> i64 {
        self.0
    }
}

/// Controller readiness as reported by the `V` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadinessStatus {
    /// `R`: program finished, ready for the next command.
    Ready,
    /// `B`: executing a program.
    Busy,
    /// `J`: jog mode.
    JogMode,
    /// `b`: jogging/slewing.
    Slewing,
    /// Anything else, including an empty line.
    Unknown,
}

impl ReadinessStatus {
    /// True only for [`ReadinessStatus::Ready`].
    pub fn is_ready(self) -> bool {
        self == ReadinessStatus::Ready
    }
}

/// A single command line, without its `\r` terminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command(String);

impl Command {
    /// Command text as sent, minus the terminator.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operation codes for the composite `E,C,<op><motor>M<value>,R` family.
#[derive(Debug, Clone, Copy)]
enum Op {
    Speed,
    IndexAbsolute,
    Index,
}

impl Op {
    fn code(self) -> &'static str {
        match self {
            Op::Speed => "S",
            Op::IndexAbsolute => "IA",
            Op::Index => "I",
        }
    }
}

fn composite(op: Op, axis: Axis, value: impl fmt::Display) -> Command {
    Command(format!(
        "E,C,{}{}M{},R",
        op.code(),
        axis.motor_index(),
        value
    ))
}

/// `E,C,S{motor}M{velocity},R`. Fails before building anything if out of range.
pub fn encode_set_velocity(axis: Axis, velocity: i64) -> StageResult<Command> {
    let velocity = Velocity::new(velocity)?;
    Ok(encode_velocity(axis, velocity))
}

/// Infallible form of [`encode_set_velocity`] for an already validated speed.
pub fn encode_velocity(axis: Axis, velocity: Velocity) -> Command {
    composite(Op::Speed, axis, velocity)
}

/// `E,C,IA{motor}M0,R`: absolute index to the stored zero.
pub fn encode_zero(axis: Axis) -> Command {
    composite(Op::IndexAbsolute, axis, 0)
}

/// `E,C,I{motor}M{steps},R`. Negative steps move in reverse.
pub fn encode_relative_move(axis: Axis, steps: i64) -> Command {
    composite(Op::Index, axis, steps)
}

/// Bare axis letter.
pub fn encode_position_query(axis: Axis) -> Command {
    Command(axis.letter().to_string())
}

/// `V`.
pub fn encode_readiness_query() -> Command {
    Command("V".to_string())
}

/// Decode `<axis><sign><7 digits>` into a signed step count.
///
/// Exactly the seven digits at bytes 2..9 are consumed; anything shorter, a
/// missing sign or a non-digit in that window is rejected.
pub fn decode_position(line: &str) -> StageResult<Position> {
    let bytes = line.as_bytes();
    if bytes.len() < POSITION_RESPONSE_LEN {
        return Err(StageError::malformed(line, "shorter than 9 characters"));
    }

    let negative = match bytes[1] {
        b'+' => false,
        b'-' => true,
        _ => return Err(StageError::malformed(line, "missing sign at byte 1")),
    };

    let digits = &bytes[2..POSITION_RESPONSE_LEN];
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(StageError::malformed(line, "bytes 2-8 are not all digits"));
    }

    let magnitude = digits
        .iter()
        .fold(0i64, |acc, d| acc * 10 + i64::from(d - b'0'));

    Ok(Position(if negative { -magnitude } else { magnitude }))
}

/// Map the first character of a `V` response. Never fails.
pub fn decode_readiness(line: &str) -> ReadinessStatus {
    match line.chars().next() {
        Some('R') => ReadinessStatus::Ready,
        Some('B') => ReadinessStatus::Busy,
        Some('J') => ReadinessStatus::JogMode,
        Some('b') => ReadinessStatus::Slewing,
        _ => ReadinessStatus::Unknown,
    }
}
