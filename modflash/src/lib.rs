//! # modflash
//!
//! A library for flashing firmware and TLS root certificates onto the
//! wireless modules found on maker boards.
//!
//! This crate provides the core functionality for talking to the modules
//! through the board's serial port, including:
//!
//! - Binary command framing for the NINA/WINC flasher bootloader
//! - Chunked erase/write/verify with readback or MD5 checks
//! - AT-command firmware install for SARA modems
//! - Root certificate conversion from files or live TLS servers
//! - A retrying upload orchestrator with cooperative cancellation
//!
//! ## Supported Modules
//!
//! - NINA-W10 (firmware and certificates)
//! - WINC1500 (firmware and certificates)
//! - SARA-R4 (firmware)
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for result types
//!
//! ## Example
//!
//! ```rust,no_run
//! use modflash::{CancelToken, Module, NativeSessionFactory, UploadPlan, Uploader};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut plan = UploadPlan::new(Module::from_name("NINA")?, "/dev/ttyACM0");
//!     plan.firmware = Some(std::fs::read("NINA_W102-v1.5.0.bin")?);
//!
//!     let sessions = NativeSessionFactory;
//!     let uploader = Uploader::new(&sessions, CancelToken::new());
//!     let result = uploader.run(&plan, &mut |transfer, percent| {
//!         println!("{transfer:?}: {percent}%");
//!     })?;
//!     println!("{result:?}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod cert;
pub mod error;
pub mod port;
pub mod programmer;
pub mod protocol;
pub mod result;
pub mod target;
pub mod touch;
pub mod upload;

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
#[cfg(feature = "native")]
pub use touch::SerialTouch;
#[cfg(feature = "native")]
pub use upload::NativeSessionFactory;
pub use {
    cancel::CancelToken,
    cert::{Certificate, CertificateEntry, CertificateLayout, encode_region},
    error::{Error, Result},
    port::{BAUD_RATES, Port, PortEnumerator, PortInfo, SerialConfig, open_with_baud_negotiation},
    programmer::{CommandProgrammer, Programmer},
    protocol::{AtDriver, Command, CommandFrame},
    result::{ExecOutput, FlashResult, parse_firmware_version},
    target::{BootloaderFlasher, Flasher, Module, SaraFlasher, chunk_plan},
    touch::BootloaderTouch,
    upload::{Backoff, RetryPolicy, SessionFactory, Transfer, UploadPlan, Uploader},
};
