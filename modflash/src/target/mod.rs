//! Module abstraction for the supported wireless co-processors.
//!
//! Each [`Module`] maps onto one flash engine: NINA and WINC1500 speak the
//! binary bootloader protocol ([`bootloader`]), SARA is driven with AT
//! commands ([`sara`]). The orchestrator only sees the [`Flasher`] trait.

pub mod bootloader;
pub mod sara;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::cert::CertificateLayout;
use crate::error::{Error, Result};
use crate::port::Port;

pub use bootloader::{BootloaderFlasher, MIN_PAYLOAD_SIZE, chunk_plan};
pub use sara::{SaraFlasher, SaraTimings};

/// Supported modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Module {
    /// u-blox NINA-W10 (ESP32 based), MD5-verified firmware.
    Nina,
    /// Microchip WINC1500, readback-verified writes.
    Winc,
    /// u-blox SARA-R4 modem, AT-command firmware install.
    Sara,
}

impl Module {
    /// All supported modules.
    pub const ALL: [Self; 3] = [Self::Nina, Self::Winc, Self::Sara];

    /// Parse a module identifier (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "NINA" => Ok(Self::Nina),
            "WINC" | "WINC1500" => Ok(Self::Winc),
            "SARA" => Ok(Self::Sara),
            _ => Err(Error::UnknownModule(name.to_string())),
        }
    }

    /// Whether the module uses the binary bootloader protocol.
    #[must_use]
    pub fn uses_bootloader(&self) -> bool {
        matches!(self, Self::Nina | Self::Winc)
    }

    /// Flash offset of the firmware region.
    #[must_use]
    pub fn firmware_offset(&self) -> u32 {
        0x0000
    }

    /// Flash offset of the certificate region, if the module has one.
    #[must_use]
    pub fn certificates_offset(&self) -> Option<u32> {
        match self {
            Self::Nina => Some(0x10000),
            Self::Winc => Some(0x4000),
            Self::Sara => None,
        }
    }

    /// Capacity of the certificate region, when bounded.
    #[must_use]
    pub fn certificates_limit(&self) -> Option<usize> {
        match self {
            Self::Nina => Some(0x20000),
            _ => None,
        }
    }

    /// Default certificate record layout.
    #[must_use]
    pub fn certificate_layout(&self) -> Option<CertificateLayout> {
        match self {
            Self::Nina => Some(CertificateLayout::Records),
            Self::Winc => Some(CertificateLayout::HeaderRecords),
            Self::Sara => None,
        }
    }

    /// Time for the board to re-enumerate after the loader image is flashed.
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        match self {
            Self::Nina | Self::Winc => Duration::from_secs(3),
            Self::Sara => Duration::from_secs(2),
        }
    }

    /// Open an engine for this module on the given port.
    pub fn create_flasher_with_port<P: Port + 'static>(
        &self,
        port: P,
        cancel: CancelToken,
    ) -> Result<Box<dyn Flasher>> {
        match self {
            Self::Nina | Self::Winc => Ok(Box::new(BootloaderFlasher::new(port, *self, cancel)?)),
            Self::Sara => Ok(Box::new(SaraFlasher::new(port, cancel))),
        }
    }

    /// Open the module port with baud negotiation and create its engine.
    #[cfg(feature = "native")]
    pub fn create_flasher(&self, port_name: &str, cancel: CancelToken) -> Result<Box<dyn Flasher>> {
        let port = crate::port::NativePort::open_negotiated(port_name)?;
        self.create_flasher_with_port(port, cancel)
    }
}

impl FromStr for Module {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nina => write!(f, "NINA"),
            Self::Winc => write!(f, "WINC1500"),
            Self::Sara => write!(f, "SARA"),
        }
    }
}

/// Flash session for one module.
///
/// A value is created per upload attempt and owns the serial port until
/// [`Flasher::close`] or drop.
pub trait Flasher {
    /// The module this engine drives.
    fn module(&self) -> Module;

    /// Handshake and capability discovery.
    fn hello(&mut self) -> Result<()>;

    /// Negotiated transfer chunk size, once known.
    fn payload_size(&self) -> Option<usize>;

    /// Flash and verify a firmware image.
    ///
    /// `progress` receives percentages in `0..=100`, monotonic, ending at 100.
    fn flash_firmware(&mut self, data: &[u8], progress: &mut dyn FnMut(u8)) -> Result<()>;

    /// Flash an encoded certificate region.
    fn flash_certificates(&mut self, region: &[u8], progress: &mut dyn FnMut(u8)) -> Result<()>;

    /// Firmware version reported by the module, when it can tell.
    fn firmware_version(&mut self) -> Result<Option<String>> {
        Ok(None)
    }

    /// Release the port. Safe to call more than once.
    fn close(&mut self);
}
