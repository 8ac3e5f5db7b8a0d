//! AT command request/response driver.
//!
//! The modem answers in free-form text, so the driver accumulates everything
//! it reads and succeeds once the buffer contains the expected marker and is
//! long enough. Reads are issued in short slices so the response timeout
//! and the cancel token hold whatever timeout the port was opened with.

use log::{debug, trace};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::port::{Port, read_before, restore_timeout};

/// Line terminator appended to every command.
pub const CRLF: &str = "\r\n";

/// Read buffer size per poll.
const READ_CHUNK: usize = 1024;

/// Blocking AT driver over a [`Port`].
pub struct AtDriver<P: Port> {
    port: P,
    cancel: CancelToken,
}

impl<P: Port> AtDriver<P> {
    /// Wrap an open port.
    pub fn new(port: P, cancel: CancelToken) -> Self {
        Self { port, cancel }
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Send `command` followed by CRLF, then wait for `expected`.
    ///
    /// Returns the accumulated response once it contains `expected` and is at
    /// least `min_bytes` long. Fails with [`Error::ResponseTimeout`] carrying
    /// the partial response when `timeout` elapses first.
    pub fn expect(
        &mut self,
        command: &str,
        expected: &str,
        timeout: Duration,
        min_bytes: usize,
    ) -> Result<String> {
        self.cancel.check()?;
        debug!("AT> {command:?} (expecting {expected:?})");

        let line = format!("{command}{CRLF}");
        self.port.write_all_bytes(line.as_bytes())?;

        let original = self.port.timeout();
        let outcome = self.collect(expected, Instant::now() + timeout, min_bytes);
        restore_timeout(&mut self.port, original);
        outcome
    }

    fn collect(&mut self, expected: &str, deadline: Instant, min_bytes: usize) -> Result<String> {
        let mut received = Vec::new();
        let mut buf = [0u8; READ_CHUNK];

        loop {
            let n = read_before(&mut self.port, &mut buf, deadline, &self.cancel)?;
            if n > 0 {
                trace!("AT< {:?}", String::from_utf8_lossy(&buf[..n]));
                received.extend_from_slice(&buf[..n]);
            }

            let text = String::from_utf8_lossy(&received);
            if text.contains(expected) && received.len() >= min_bytes {
                return Ok(text.into_owned());
            }
            if n == 0 {
                return Err(Error::ResponseTimeout {
                    expected: expected.to_string(),
                    received: text.into_owned(),
                });
            }
        }
    }

    /// Write raw bytes without framing or line terminator.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all_bytes(data)
    }

    /// Release the port; later calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        self.port.close()
    }
}
