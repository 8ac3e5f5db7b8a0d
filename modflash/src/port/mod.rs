//! Port abstraction for serial communication with the module bridge.
//!
//! The flash engines are generic over [`Port`], so the protocol layer never
//! touches `serialport` directly and can be driven by scripted ports in tests.
//!
//! ```text
//! +--------------------+   +--------------------+
//! | Bootloader engine  |   |  AT-command engine |
//! |   (NINA, WINC)     |   |      (SARA)        |
//! +---------+----------+   +---------+----------+
//!           |                        |
//!           v                        v
//! +---------+------------------------+----------+
//! |                 Port trait                  |
//! +---------------------+-----------------------+
//!                       |
//!                       v
//!            +----------+---------+
//!            |  NativePort        |
//!            |  (serialport)      |
//!            +--------------------+
//! ```
//!
//! Opening a port goes through [`open_with_baud_negotiation`], which tries
//! [`BAUD_RATES`] in order and keeps the first one the OS driver accepts.

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Baud rates tried, in order, when opening a module port.
pub const BAUD_RATES: [u32; 4] = [115_200, 57_600, 56_000, 38_400];

/// Read timeout applied to negotiated ports.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest single blocking read issued by [`read_before`].
pub const READ_SLICE: Duration = Duration::from_millis(50);

/// Serial port configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: READ_TIMEOUT,
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
}

/// Unified port trait for serial communication.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Set the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// Calling this more than once is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, looping over partial writes until everything is sent.
    ///
    /// A port that accepts zero bytes is reported as [`std::io::ErrorKind::WriteZero`].
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        let mut remaining = buf;
        while !remaining.is_empty() {
            match self.write(remaining) {
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        format!("port accepted 0 of {} bytes", remaining.len()),
                    )));
                },
                Ok(sent) => {
                    if sent < remaining.len() {
                        debug!("Sent {sent} bytes out of {}", remaining.len());
                    }
                    remaining = &remaining[sent..];
                },
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
        self.flush()?;
        Ok(())
    }
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        (**self).set_baud_rate(baud_rate)
    }

    fn baud_rate(&self) -> u32 {
        (**self).baud_rate()
    }

    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        (**self).set_dtr(level)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Trait for listing available serial ports.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

/// Open `port_name` at the first baud rate in `rates` that succeeds.
///
/// `open` performs a single open attempt; every attempt uses [`READ_TIMEOUT`].
/// Fails with [`Error::PortUnavailable`] only when every rate fails.
pub fn open_with_baud_negotiation<P, F>(port_name: &str, rates: &[u32], mut open: F) -> Result<P>
where
    F: FnMut(&SerialConfig) -> Result<P>,
{
    let mut last_error = None;

    for &baud_rate in rates {
        let config = SerialConfig::new(port_name, baud_rate);
        match open(&config) {
            Ok(port) => {
                info!("Opened port {port_name} at {baud_rate}");
                return Ok(port);
            },
            Err(e) => {
                debug!("Opening {port_name} at {baud_rate} failed: {e}");
                last_error = Some(e);
            },
        }
    }

    Err(Error::PortUnavailable {
        port: port_name.to_string(),
        reason: last_error.map_or_else(|| "no baud rates to try".to_string(), |e| e.to_string()),
    })
}

/// Read whatever arrives before `deadline`, in [`READ_SLICE`] steps.
///
/// The port timeout is lowered for each step, so a silent line never blocks
/// past `deadline` and `cancel` is seen at least once per slice. Returns 0
/// once the deadline passes with nothing read. The caller restores the
/// port timeout.
pub fn read_before<P: Port + ?Sized>(
    port: &mut P,
    buf: &mut [u8],
    deadline: Instant,
    cancel: &CancelToken,
) -> Result<usize> {
    loop {
        cancel.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(0);
        }
        port.set_timeout(READ_SLICE.min(deadline - now))?;
        match port.read(buf) {
            Ok(0) => {},
            Ok(n) => return Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {},
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// Set the port timeout back to `timeout`, logging on failure.
pub(crate) fn restore_timeout<P: Port + ?Sized>(port: &mut P, timeout: Duration) {
    if let Err(e) = port.set_timeout(timeout) {
        debug!("Failed to restore read timeout on {}: {e}", port.name());
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
