//! Serial channel to the controller.
//!
//! This module provides the line-oriented transport the stage driver talks
//! through, and the helpers for opening the real RS-232 port.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`Channel`]: Command/response contract the axis controllers depend on
//! - [`SerialChannel`]: [`Channel`] over any [`DynSerial`]
//! - [`SharedChannel`]: The single channel slot shared by all axes of a stage
//!
//! # Example
//!
//! ```rust,ignore
//! use vxm_stage::serial::{open_serial_async, SerialChannel, Channel};
//!
//! let port = open_serial_async("/dev/ttyUSB0", 9600, "VXM").await?;
//! let mut channel = SerialChannel::new(Box::new(port));
//! channel.write_line("V").await?;
//! let status = channel.read_line(Duration::from_millis(100)).await?;
//! ```

use crate::error::{StageError, StageResult};
use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Command terminator expected by the controller.
pub const COMMAND_TERMINATOR: &str = "\r";

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
/// - [`crate::mock_serial::MockSerialPort`] (scripted device)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Channel
// =============================================================================

/// Line-oriented duplex link to the controller.
///
/// The protocol carries no request identifiers, so a response can only be
/// attributed to the most recently written command. Callers must hold the
/// channel for the whole write/read pair.
#[async_trait]
pub trait Channel: Send {
    /// Discard stale input, then send `line` followed by `\r`.
    async fn write_line(&mut self, line: &str) -> StageResult<()>;

    /// Read one `\n`-terminated line with the terminator stripped.
    ///
    /// Returns [`StageError::Timeout`] if nothing complete arrives in `timeout`.
    async fn read_line(&mut self, timeout: Duration) -> StageResult<String>;

    /// Release the underlying port. Later calls fail with [`StageError::ChannelClosed`].
    async fn close(&mut self) -> StageResult<()>;
}

/// Slot holding the stage's one channel. `None` once the stage is disposed.
pub type SharedChannel = Arc<Mutex<Option<Box<dyn Channel>>>>;

/// Wrap a channel for sharing between the axis controllers of one stage.
pub fn wrap_shared(channel: Box<dyn Channel>) -> SharedChannel {
    Arc::new(Mutex::new(Some(channel)))
}

/// [`Channel`] implementation over a buffered async byte stream.
pub struct SerialChannel {
    port: Option<BufReader<DynSerial>>,
}

impl SerialChannel {
    /// Wrap an already opened port.
    pub fn new(port: DynSerial) -> Self {
        Self {
            port: Some(BufReader::new(port)),
        }
    }

    fn port(&mut self) -> StageResult<&mut BufReader<DynSerial>> {
        self.port.as_mut().ok_or(StageError::ChannelClosed)
    }
}

#[async_trait]
impl Channel for SerialChannel {
    async fn write_line(&mut self, line: &str) -> StageResult<()> {
        let port = self.port()?;

        let discarded = discard_stale_input(port);
        if discarded > 0 {
            tracing::warn!(bytes = discarded, "Discarded stale bytes before sending {:?}", line);
        }

        let frame = format!("{}{}", line, COMMAND_TERMINATOR);
        let writer = port.get_mut();
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await?;
        tracing::debug!(command = line, "Sent stage command");
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> StageResult<String> {
        let port = self.port()?;

        // Raw bytes: line noise must reach the decoders, not fail as I/O
        let mut response = Vec::new();
        let read = tokio::time::timeout(timeout, port.read_until(b'\n', &mut response))
            .await
            .map_err(|_| StageError::Timeout(timeout))??;
        if read == 0 {
            return Err(StageError::ChannelClosed);
        }

        let line = String::from_utf8_lossy(&response)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        tracing::debug!(response = %line, "Received stage response");
        Ok(line)
    }

    async fn close(&mut self) -> StageResult<()> {
        match self.port.take() {
            Some(mut port) => {
                port.get_mut().shutdown().await?;
                Ok(())
            }
            None => Err(StageError::ChannelClosed),
        }
    }
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Drop everything already received but not yet read.
///
/// Clears the `BufReader` buffer first, then pulls from the port for as long
/// as it can deliver bytes without waiting. Returns the number of bytes
/// discarded.
pub fn discard_stale_input<R: AsyncRead + Unpin>(port: &mut BufReader<R>) -> usize {
    let buffered = port.buffer().len();
    port.consume(buffered);

    let mut discard = [0u8; 256];
    let mut total_discarded = buffered;
    let inner = port.get_mut();
    // `now_or_never` only polls once, so this never blocks on a quiet port
    while let Some(Ok(n)) = inner.read(&mut discard).now_or_never() {
        if n == 0 {
            break;
        }
        total_discarded += n;
    }
    total_discarded
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// This function wraps the serial port opening in `spawn_blocking` to avoid
/// blocking the async runtime during port initialization. Standard settings
/// are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns [`StageError::Io`] if the port cannot be opened or spawn_blocking fails.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> StageResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    let opened = spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!(
                        "Failed to open {} serial port {}: {}",
                        device_name_owned, port_path_owned, e
                    ),
                )
            })
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

    tracing::info!(port = port_path, baud_rate, "Opened {} serial port", device_name);
    Ok(opened)
}
