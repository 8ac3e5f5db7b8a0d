//! SARA-R4 firmware install over AT commands.
//!
//! The image is uploaded to the modem file system as `UPDATE.BIN` and
//! installed with `AT+UFWINSTALL`; the modem then reboots and is polled
//! until it answers again. The upload is a raw byte stream: there is no
//! framing and no per-block acknowledgment.

use log::{debug, info, warn};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::at::AtDriver;
use crate::target::{Flasher, Module};

/// Raw upload slice size.
pub const UPLOAD_SLICE: usize = 128;

/// Prefix of the `ATI9` reply for supported firmware.
pub const VERSION_PREFIX: &str = "05.06,A.02.";

/// Timing of the install sequence.
#[derive(Debug, Clone)]
pub struct SaraTimings {
    /// `AT+ULSTFILE` reply window.
    pub list_timeout: Duration,
    /// Wait for the `>` upload prompt.
    pub prompt_timeout: Duration,
    /// Pause after the upload stream.
    pub upload_settle: Duration,
    /// Upload confirmation window.
    pub confirm_timeout: Duration,
    /// `AT+UFWINSTALL` reply window.
    pub install_timeout: Duration,
    /// Pause before polling the rebooting modem.
    pub reboot_settle: Duration,
    /// Delay between hello polls.
    pub poll_interval: Duration,
    /// Give up polling after this long.
    pub poll_deadline: Duration,
    /// Reply window of each hello command.
    pub hello_timeout: Duration,
    /// `ATI9` reply window.
    pub version_timeout: Duration,
}

impl Default for SaraTimings {
    fn default() -> Self {
        Self {
            list_timeout: Duration::from_secs(1),
            prompt_timeout: Duration::from_secs(20),
            upload_settle: Duration::from_secs(1),
            confirm_timeout: Duration::from_secs(1),
            install_timeout: Duration::from_secs(60),
            reboot_settle: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            poll_deadline: Duration::from_secs(20 * 60),
            hello_timeout: Duration::from_millis(100),
            version_timeout: Duration::from_millis(100),
        }
    }
}

/// AT-command flash engine for SARA modems.
pub struct SaraFlasher<P: Port> {
    at: AtDriver<P>,
    timings: SaraTimings,
    cancel: CancelToken,
}

impl<P: Port> SaraFlasher<P> {
    /// Create an engine over an open port.
    pub fn new(port: P, cancel: CancelToken) -> Self {
        Self {
            at: AtDriver::new(port, cancel.clone()),
            timings: SaraTimings::default(),
            cancel,
        }
    }

    /// Override the install sequence timing.
    #[must_use]
    pub fn with_timings(mut self, timings: SaraTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        self.at.port()
    }

    /// One liveness probe: three `ATE0` then `AT`.
    ///
    /// Echo-disable replies are not checked; the final `AT` must answer `OK`.
    pub fn ping(&mut self) -> Result<()> {
        let timeout = self.timings.hello_timeout;
        for _ in 0..3 {
            match self.at.expect("ATE0", "OK", timeout, 0) {
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => debug!("ATE0: {e}"),
                Ok(_) => {},
            }
        }
        self.at.expect("AT", "OK", timeout, 0).map(|_| ())
    }

    /// Run the full upload and install sequence.
    pub fn install(&mut self, data: &[u8], progress: &mut dyn FnMut(u8)) -> Result<()> {
        let t = self.timings.clone();

        self.at.expect("AT+ULSTFILE", "+ULSTFILE:", t.list_timeout, 0)?;
        let announce = format!("AT+UDWNFILE=\"UPDATE.BIN\",{},\"FOAT\"", data.len());
        self.at.expect(&announce, ">", t.prompt_timeout, 0)?;

        info!("Uploading {} bytes to the modem", data.len());
        let total = data.len().max(1);
        for (i, slice) in data.chunks(UPLOAD_SLICE).enumerate() {
            self.cancel.check()?;
            progress((i * UPLOAD_SLICE * 100 / total) as u8);
            self.at.write_raw(slice)?;
        }

        self.cancel.sleep(t.upload_settle)?;
        self.at.expect("", "OK", t.confirm_timeout, 0)?;

        info!("Installing firmware, the modem will reboot");
        self.at.expect("AT+UFWINSTALL", "OK", t.install_timeout, 0)?;
        self.cancel.sleep(t.reboot_settle)?;

        self.wait_for_reboot()?;
        progress(100);
        Ok(())
    }

    fn wait_for_reboot(&mut self) -> Result<()> {
        let start = Instant::now();
        let mut last = None;
        while start.elapsed() < self.timings.poll_deadline {
            match self.ping() {
                Ok(()) => {
                    info!("Modem is back after {:.0?}", start.elapsed());
                    return Ok(());
                },
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => last = Some(e),
            }
            self.cancel.sleep(self.timings.poll_interval)?;
        }
        if let Some(e) = last {
            warn!("Last hello failure: {e}");
        }
        Err(Error::Timeout(format!(
            "modem did not answer within {:?} after install",
            self.timings.poll_deadline
        )))
    }
}

impl<P: Port> Flasher for SaraFlasher<P> {
    fn module(&self) -> Module {
        Module::Sara
    }

    fn hello(&mut self) -> Result<()> {
        self.ping()
    }

    fn payload_size(&self) -> Option<usize> {
        Some(UPLOAD_SLICE)
    }

    fn flash_firmware(&mut self, data: &[u8], progress: &mut dyn FnMut(u8)) -> Result<()> {
        self.install(data, progress)
    }

    fn flash_certificates(&mut self, _region: &[u8], _progress: &mut dyn FnMut(u8)) -> Result<()> {
        Err(Error::Unsupported(
            "certificate upload is not available for SARA".into(),
        ))
    }

    fn firmware_version(&mut self) -> Result<Option<String>> {
        let reply = self
            .at
            .expect("ATI9", VERSION_PREFIX, self.timings.version_timeout, 25)?;
        let version = reply
            .lines()
            .map(str::trim)
            .find(|line| line.contains(VERSION_PREFIX))
            .unwrap_or_else(|| reply.trim())
            .to_string();
        Ok(Some(version))
    }

    fn close(&mut self) {
        if let Err(e) = self.at.close() {
            debug!("Error closing port: {e}");
        }
    }
}

impl<P: Port> Drop for SaraFlasher<P> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::ScriptedPort;
    use std::sync::{Arc, Mutex};

    fn fast() -> SaraTimings {
        SaraTimings {
            list_timeout: Duration::from_millis(50),
            prompt_timeout: Duration::from_millis(50),
            upload_settle: Duration::ZERO,
            confirm_timeout: Duration::from_millis(50),
            install_timeout: Duration::from_millis(50),
            reboot_settle: Duration::ZERO,
            poll_interval: Duration::ZERO,
            poll_deadline: Duration::from_millis(300),
            hello_timeout: Duration::from_millis(5),
            version_timeout: Duration::from_millis(50),
        }
    }

    /// Modem that answers every AT line; raw upload bytes are collected.
    fn modem(hello_ok_after: usize) -> (ScriptedPort, Arc<Mutex<Vec<u8>>>) {
        let uploaded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&uploaded);
        let mut pings = 0;
        let mut uploading = false;
        let port = ScriptedPort::new().with_responder(move |bytes| {
            if uploading && !bytes.ends_with(b"\r\n") {
                sink.lock().unwrap().extend_from_slice(bytes);
                return None;
            }
            let line = String::from_utf8_lossy(bytes);
            let line = line.trim_end();
            match line {
                "AT+ULSTFILE" => Some(b"\r\n+ULSTFILE: \"cfg\"\r\nOK\r\n".to_vec()),
                l if l.starts_with("AT+UDWNFILE") => {
                    uploading = true;
                    Some(b">".to_vec())
                },
                "" => {
                    uploading = false;
                    Some(b"\r\nOK\r\n".to_vec())
                },
                "AT+UFWINSTALL" => Some(b"\r\nOK\r\n".to_vec()),
                "ATE0" => None,
                "AT" => {
                    pings += 1;
                    (pings > hello_ok_after).then(|| b"\r\nOK\r\n".to_vec())
                },
                "ATI9" => Some(b"\r\n05.06,A.02.00,A.02.04\r\n\r\nOK\r\n".to_vec()),
                _ => Some(b"\r\nERROR\r\n".to_vec()),
            }
        });
        (port, uploaded)
    }

    #[test]
    fn test_install_sequence() {
        let (port, uploaded) = modem(2);
        let mut flasher = SaraFlasher::new(port, CancelToken::new()).with_timings(fast());

        let data: Vec<u8> = (0..300u32).map(|i| (i % 200) as u8).collect();
        let mut seen = Vec::new();
        flasher.flash_firmware(&data, &mut |p| seen.push(p)).unwrap();

        assert_eq!(*uploaded.lock().unwrap(), data);
        assert_eq!(seen, vec![0, 42, 85, 100]);

        let written = String::from_utf8_lossy(flasher.port().written()).into_owned();
        assert!(written.starts_with("AT+ULSTFILE\r\nAT+UDWNFILE=\"UPDATE.BIN\",300,\"FOAT\"\r\n"));
        assert!(written.contains("AT+UFWINSTALL\r\n"));
        assert!(written.ends_with("ATE0\r\nATE0\r\nATE0\r\nAT\r\n"));
    }

    #[test]
    fn test_modem_never_returns() {
        let (port, _) = modem(usize::MAX);
        let mut flasher = SaraFlasher::new(port, CancelToken::new()).with_timings(fast());
        let result = flasher.flash_firmware(&[0u8; 10], &mut |_| {});
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_missing_prompt_times_out() {
        let mut port = ScriptedPort::new();
        port.push_read(b"+ULSTFILE: \r\nOK\r\n");
        let mut flasher = SaraFlasher::new(port, CancelToken::new()).with_timings(fast());
        let result = flasher.flash_firmware(&[0u8; 10], &mut |_| {});
        assert!(matches!(
            result,
            Err(Error::ResponseTimeout { expected, .. }) if expected == ">"
        ));
    }

    #[test]
    fn test_firmware_version() {
        let (port, _) = modem(0);
        let mut flasher = SaraFlasher::new(port, CancelToken::new()).with_timings(fast());
        let version = flasher.firmware_version().unwrap();
        assert_eq!(version.as_deref(), Some("05.06,A.02.00,A.02.04"));
    }

    #[test]
    fn test_certificates_unsupported() {
        let mut flasher = SaraFlasher::new(ScriptedPort::new(), CancelToken::new());
        assert!(matches!(
            flasher.flash_certificates(&[1, 2, 3], &mut |_| {}),
            Err(Error::Unsupported(_))
        ));
    }
}
