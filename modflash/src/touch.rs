//! 1200bps touch: reset a board into its bootloader.
//!
//! Opening the CDC port at 1200 baud and dropping DTR asks the board to
//! reboot into the bootloader, which may enumerate under a new port name.

use log::{debug, info};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::Result;

/// Baud rate that triggers the reset.
pub const TOUCH_BAUD: u32 = 1200;

/// How long to watch for the bootloader port.
pub const PORT_WAIT: Duration = Duration::from_secs(10);

/// Puts a board into bootloader mode.
pub trait BootloaderTouch {
    /// Reset the board on `port`; returns the new port when it moved.
    fn reset(&self, port: &str, cancel: &CancelToken) -> Result<Option<String>>;
}

/// First port in `after` that was not in `before`.
pub fn new_port(before: &[String], after: &[String]) -> Option<String> {
    after.iter().find(|p| !before.contains(p)).cloned()
}

/// Poll `list` until a port shows up that was not in `before`.
pub fn wait_for_new_port<F>(
    before: &[String],
    mut list: F,
    timeout: Duration,
    interval: Duration,
    cancel: &CancelToken,
) -> Result<Option<String>>
where
    F: FnMut() -> Result<Vec<String>>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        cancel.sleep(interval)?;
        let after = list()?;
        if let Some(port) = new_port(before, &after) {
            return Ok(Some(port));
        }
    }
    Ok(None)
}

/// Touch implemented on native serial ports.
#[cfg(feature = "native")]
#[derive(Debug, Clone)]
pub struct SerialTouch {
    wait_for_port: bool,
    timeout: Duration,
}

#[cfg(feature = "native")]
impl Default for SerialTouch {
    fn default() -> Self {
        Self {
            wait_for_port: true,
            timeout: PORT_WAIT,
        }
    }
}

#[cfg(feature = "native")]
impl SerialTouch {
    /// Create a touch that waits for the bootloader port.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether to watch for the board coming back on another port.
    #[must_use]
    pub fn with_wait_for_port(mut self, wait: bool) -> Self {
        self.wait_for_port = wait;
        self
    }

    fn port_names() -> Result<Vec<String>> {
        use crate::port::{NativePortEnumerator, PortEnumerator};
        Ok(NativePortEnumerator::list_ports()?
            .into_iter()
            .map(|p| p.name)
            .collect())
    }
}

#[cfg(feature = "native")]
impl BootloaderTouch for SerialTouch {
    fn reset(&self, port: &str, cancel: &CancelToken) -> Result<Option<String>> {
        use crate::port::{NativePort, Port, SerialConfig};

        info!("Touching port {port} at {TOUCH_BAUD}bps");
        let before = Self::port_names()?;

        {
            let config = SerialConfig::new(port, TOUCH_BAUD).with_timeout(Duration::from_millis(100));
            let mut serial = NativePort::open(&config)?;
            serial.set_dtr(false)?;
            serial.close()?;
        }

        if !self.wait_for_port {
            cancel.sleep(Duration::from_millis(200))?;
            return Ok(None);
        }

        let found = wait_for_new_port(
            &before,
            Self::port_names,
            self.timeout,
            Duration::from_millis(100),
            cancel,
        )?;
        match &found {
            Some(new) => info!("Found port to upload: {new}"),
            None => debug!("No new port appeared, keeping {port}"),
        }
        Ok(found)
    }
}
