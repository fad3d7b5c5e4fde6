//! Scripted VXM controller for tests.
//!
//! `MockSerialPort` implements `AsyncRead` and `AsyncWrite` and is handed to
//! the code under test in place of a real serial stream. The paired
//! `MockDeviceHarness` stays in the test and plays the controller: it asserts
//! on the command lines written and feeds response lines back.
//!
//! # Architecture
//!
//! A pair of unbounded channels carries bytes each way:
//! - `MockSerialPort` (given to the driver): implements AsyncRead/AsyncWrite
//! - `MockDeviceHarness` (kept in test): scripts device behavior
//!
//! # Example
//!
//! ```rust,ignore
//! use vxm_stage::mock_serial;
//! use vxm_stage::serial::{Channel, SerialChannel};
//!
//! #[tokio::test]
//! async fn readiness_round_trip() {
//!     let (port, mut harness) = mock_serial::new();
//!     let mut channel = SerialChannel::new(Box::new(port));
//!
//!     let app_task = tokio::spawn(async move {
//!         channel.write_line("V").await.unwrap();
//!         channel.read_line(Duration::from_millis(100)).await.unwrap()
//!     });
//!
//!     harness.expect_and_respond("V", "R").await;
//!     assert_eq!(app_task.await.unwrap(), "R");
//! }
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// How long harness expectations wait before failing the test.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// The driver-facing side of the mock serial port.
#[derive(Debug)]
pub struct MockSerialPort {
    /// Channel to send written data to the harness
    writes_tx: UnboundedSender<Vec<u8>>,
    /// Channel to receive data from the harness to be read
    reads_rx: UnboundedReceiver<Vec<u8>>,
    /// Data received from the harness but not yet read by the driver
    read_buffer: VecDeque<u8>,
}

/// The test-facing side that plays the controller.
#[derive(Debug)]
pub struct MockDeviceHarness {
    /// Channel to receive data written by the driver
    writes_rx: UnboundedReceiver<Vec<u8>>,
    /// Channel to send data to the driver for it to read
    reads_tx: UnboundedSender<Vec<u8>>,
    /// Bytes written by the driver but not yet asserted by the test
    write_buffer: Vec<u8>,
}

/// Creates a new connected pair of `MockSerialPort` and `MockDeviceHarness`.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (client_to_harness_tx, client_to_harness_rx) = mpsc::unbounded_channel();
    let (harness_to_client_tx, harness_to_client_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: client_to_harness_tx,
        reads_rx: harness_to_client_rx,
        read_buffer: VecDeque::new(),
    };

    let harness = MockDeviceHarness {
        writes_rx: client_to_harness_rx,
        reads_tx: harness_to_client_tx,
        write_buffer: Vec::new(),
    };

    (port, harness)
}

// =============================================================================
// MockSerialPort Implementations
// =============================================================================

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.fill(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.fill(buf);
                Poll::Ready(Ok(()))
            }
            // Harness dropped: end-of-file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(_) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// MockDeviceHarness Implementations
// =============================================================================

impl MockDeviceHarness {
    /// Sends raw bytes to the driver.
    ///
    /// # Errors
    /// Returns error if the driver side has been dropped
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: client port disconnected")
    }

    /// Sends one response line, appending the controller's `\n` terminator.
    ///
    /// # Errors
    /// Returns error if the driver side has been dropped
    pub fn respond_line(&self, line: &str) -> Result<(), &'static str> {
        self.send_response(format!("{}\n", line).as_bytes())
    }

    /// Waits for the driver to write specific bytes and asserts them.
    ///
    /// Incoming writes are buffered until enough bytes have arrived. Any
    /// excess is kept for the next expectation.
    ///
    /// # Panics
    /// Panics if the expected data is not received within 2 seconds or if
    /// the received data does not match.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        while self.write_buffer.len() < expected.len() {
            match tokio::time::timeout(EXPECT_TIMEOUT, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("Client-side port closed while expecting a write."),
                Err(_) => {
                    panic!(
                        "Timeout waiting for write. Expected `{:?}` ({} bytes), but only received `{:?}` ({} bytes).",
                        String::from_utf8_lossy(expected),
                        expected.len(),
                        String::from_utf8_lossy(&self.write_buffer),
                        self.write_buffer.len()
                    );
                }
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "Mismatch in expected write. Expected `{:?}`, got `{:?}`.",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );

        self.write_buffer.drain(..expected.len());
    }

    /// Waits for one `\r`-terminated command and asserts its text.
    pub async fn expect_command(&mut self, command: &str) {
        self.expect_write(format!("{}\r", command).as_bytes()).await;
    }

    /// Expects a command and answers with one response line.
    ///
    /// # Panics
    /// Panics if the expectation fails or the driver side is gone.
    pub async fn expect_and_respond(&mut self, command: &str, response: &str) {
        self.expect_command(command).await;
        self.respond_line(response)
            .unwrap_or_else(|e| panic!("{}", e));
    }

    /// Waits for the next complete `\r`-terminated command and returns its text.
    ///
    /// Returns `None` if no complete command arrives within 2 seconds.
    pub async fn next_command(&mut self) -> Option<String> {
        loop {
            if let Some(end) = self.write_buffer.iter().position(|b| *b == b'\r') {
                let line: Vec<u8> = self.write_buffer.drain(..=end).collect();
                return Some(String::from_utf8_lossy(&line[..end]).into_owned());
            }
            match tokio::time::timeout(EXPECT_TIMEOUT, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Asserts that the driver has written nothing since the last expectation.
    ///
    /// # Panics
    /// Panics if any unasserted bytes are pending.
    pub fn assert_no_writes(&mut self) {
        while let Ok(chunk) = self.writes_rx.try_recv() {
            self.write_buffer.extend_from_slice(&chunk);
        }
        assert!(
            self.write_buffer.is_empty(),
            "Unexpected write: `{:?}`",
            String::from_utf8_lossy(&self.write_buffer)
        );
    }

    /// Drains any pending writes without asserting their content.
    pub async fn drain_writes(&mut self) {
        let short_timeout = Duration::from_millis(50);

        while let Ok(Some(chunk)) = tokio::time::timeout(short_timeout, self.writes_rx.recv()).await {
            self.write_buffer.extend_from_slice(&chunk);
        }
        self.write_buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn command_response() {
        let (port, mut harness) = new();
        let mut port = BufReader::new(port);

        let app_task = tokio::spawn(async move {
            port.write_all(b"X\r").await.unwrap();
            let mut response = String::new();
            port.read_line(&mut response).await.unwrap();
            response
        });

        harness.expect_and_respond("X", "X+0000010").await;

        assert_eq!(app_task.await.unwrap(), "X+0000010\n");
    }

    #[tokio::test]
    async fn next_command_splits_on_carriage_return() {
        let (mut port, mut harness) = new();

        port.write_all(b"V\rE,C,IA1M0,R\r").await.unwrap();

        assert_eq!(harness.next_command().await.as_deref(), Some("V"));
        assert_eq!(harness.next_command().await.as_deref(), Some("E,C,IA1M0,R"));
        harness.assert_no_writes();
    }

    #[tokio::test]
    async fn drain_writes_clears_pending() {
        let (mut port, mut harness) = new();

        port.write_all(b"junk").await.unwrap();
        harness.drain_writes().await;
        harness.assert_no_writes();
    }
}
