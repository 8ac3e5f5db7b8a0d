//! Upload orchestration.
//!
//! One attempt runs the whole sequence below; the [`RetryPolicy`] repeats
//! it from the start on failure, with a fresh session every time.
//!
//! ```text
//!  touch (optional) -> loader image -> settle -> open session
//!        -> hello -> firmware -> certificates -> version -> close
//! ```

pub mod retry;

use log::{debug, info};
use std::path::PathBuf;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::programmer::Programmer;
use crate::result::{ExecOutput, FlashResult, parse_firmware_version};
use crate::target::{Flasher, Module};
use crate::touch::BootloaderTouch;

pub use retry::{Backoff, RetryPolicy};

/// Opens flash sessions.
pub trait SessionFactory {
    /// Open an engine for `module` on `port`.
    fn open(&self, module: Module, port: &str, cancel: &CancelToken) -> Result<Box<dyn Flasher>>;
}

/// Sessions on native serial ports with baud negotiation.
#[cfg(feature = "native")]
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSessionFactory;

#[cfg(feature = "native")]
impl SessionFactory for NativeSessionFactory {
    fn open(&self, module: Module, port: &str, cancel: &CancelToken) -> Result<Box<dyn Flasher>> {
        module.create_flasher(port, cancel.clone())
    }
}

/// Which region a progress update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Firmware image.
    Firmware,
    /// Certificate region.
    Certificates,
}

/// What to put on the module.
#[derive(Debug, Clone)]
pub struct UploadPlan {
    /// Target module.
    pub module: Module,
    /// Serial port of the board.
    pub port: String,
    /// Bridge sketch flashed before talking to the module.
    pub loader: Option<PathBuf>,
    /// Firmware image.
    pub firmware: Option<Vec<u8>>,
    /// Encoded certificate region.
    pub certificates: Option<Vec<u8>>,
    /// Reset the board with a 1200bps touch first.
    pub touch: bool,
    /// Ask the module for its firmware version at the end.
    pub read_version: bool,
}

impl UploadPlan {
    /// Empty plan for `module` on `port`.
    pub fn new(module: Module, port: impl Into<String>) -> Self {
        Self {
            module,
            port: port.into(),
            loader: None,
            firmware: None,
            certificates: None,
            touch: false,
            read_version: false,
        }
    }
}

/// Runs upload plans.
pub struct Uploader<'a> {
    sessions: &'a dyn SessionFactory,
    programmer: Option<&'a dyn Programmer>,
    touch: Option<&'a dyn BootloaderTouch>,
    policy: RetryPolicy,
    settle: Option<Duration>,
    cancel: CancelToken,
}

impl<'a> Uploader<'a> {
    /// Create an uploader with the default retry policy.
    pub fn new(sessions: &'a dyn SessionFactory, cancel: CancelToken) -> Self {
        Self {
            sessions,
            programmer: None,
            touch: None,
            policy: RetryPolicy::default(),
            settle: None,
            cancel,
        }
    }

    /// Programmer for the loader image.
    #[must_use]
    pub fn with_programmer(mut self, programmer: &'a dyn Programmer) -> Self {
        self.programmer = Some(programmer);
        self
    }

    /// Bootloader touch used when a plan asks for it.
    #[must_use]
    pub fn with_touch(mut self, touch: &'a dyn BootloaderTouch) -> Self {
        self.touch = Some(touch);
        self
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the per-module settle delay.
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle = Some(delay);
        self
    }

    /// Run `plan`, retrying whole attempts per the policy.
    pub fn run(
        &self,
        plan: &UploadPlan,
        progress: &mut dyn FnMut(Transfer, u8),
    ) -> Result<FlashResult> {
        self.policy
            .run(&self.cancel, |attempt| self.attempt(plan, attempt, &mut *progress))
    }

    fn attempt(
        &self,
        plan: &UploadPlan,
        attempt: u32,
        progress: &mut dyn FnMut(Transfer, u8),
    ) -> Result<FlashResult> {
        debug!("Upload attempt {attempt} for {} on {}", plan.module, plan.port);
        let mut port = plan.port.clone();

        if plan.touch {
            if let Some(touch) = self.touch {
                info!("Putting board into bootloader mode");
                if let Some(new_port) = touch.reset(&port, &self.cancel)? {
                    port = new_port;
                }
            }
        }

        let mut programmer = ExecOutput::default();
        if let (Some(flasher), Some(loader)) = (self.programmer, &plan.loader) {
            programmer = flasher.flash(loader, &port)?;
            let settle = self.settle.unwrap_or_else(|| plan.module.settle_delay());
            debug!("Waiting {settle:?} for the board to come back");
            self.cancel.sleep(settle)?;
        }

        let mut session = self.sessions.open(plan.module, &port, &self.cancel)?;
        let outcome = Self::transfer(session.as_mut(), plan, progress);
        session.close();
        let (output, device_version) = outcome?;

        let version = device_version
            .or_else(|| parse_firmware_version(&programmer.stdout))
            .or_else(|| parse_firmware_version(&output.stdout));

        Ok(FlashResult {
            programmer,
            flasher: Some(output),
            version,
        })
    }

    fn transfer(
        session: &mut dyn Flasher,
        plan: &UploadPlan,
        progress: &mut dyn FnMut(Transfer, u8),
    ) -> Result<(ExecOutput, Option<String>)> {
        let mut out = ExecOutput::default();
        session.hello()?;

        if let Some(firmware) = &plan.firmware {
            out.say(format!(
                "Flashing firmware ({} bytes) to {}",
                firmware.len(),
                plan.module
            ));
            session.flash_firmware(firmware, &mut |p| progress(Transfer::Firmware, p))?;
            out.say("Flashing progress: 100%");
        }

        if let Some(region) = &plan.certificates {
            out.say(format!(
                "Flashing certificates ({} bytes) to {}",
                region.len(),
                plan.module
            ));
            session.flash_certificates(region, &mut |p| progress(Transfer::Certificates, p))?;
        }

        let version = if plan.read_version {
            session.firmware_version()?
        } else {
            None
        };
        if let Some(v) = &version {
            out.say(format!("{}{v}", crate::result::VERSION_PREFIX));
        }

        out.say("Flashed all the things");
        Ok((out, version))
    }
}
