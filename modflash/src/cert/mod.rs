//! Root certificate conversion.
//!
//! Certificates come from files or from a live TLS handshake ([`source`]),
//! are converted to [`CertificateEntry`] records and concatenated into the
//! region flashed onto the module. The region format differs per module:
//!
//! | Layout                          | Used by  | Contents                                 |
//! |---------------------------------|----------|------------------------------------------|
//! | [`CertificateLayout::HeaderRecords`] | WINC1500 | start pattern, `u32` LE count, records |
//! | [`CertificateLayout::Records`]  | NINA     | records only                             |
//! | [`CertificateLayout::Pem`]      | NINA (newer firmware) | PEM text bundle             |

pub mod entry;
pub mod source;

use byteorder::{LittleEndian, WriteBytesExt};
use log::debug;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

pub use entry::CertificateEntry;
pub use source::{Certificate, fetch_from_host, load_file};

/// Marker opening a WINC1500 certificate region.
pub const START_PATTERN: [u8; 16] = [
    0x01, 0xF1, 0x02, 0xF2, 0x03, 0xF3, 0x04, 0xF4, 0x05, 0xF5, 0x06, 0xF6, 0x07, 0xF7, 0x08, 0xF8,
];

/// Certificate region format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum CertificateLayout {
    /// Concatenated binary records.
    Records,
    /// Start pattern and record count, then the records.
    HeaderRecords,
    /// Concatenated PEM blocks.
    Pem,
}

impl FromStr for CertificateLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "records" => Ok(Self::Records),
            "header" | "header-records" => Ok(Self::HeaderRecords),
            "pem" => Ok(Self::Pem),
            _ => Err(Error::Config(format!("unknown certificate layout: {s}"))),
        }
    }
}

impl fmt::Display for CertificateLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Records => write!(f, "records"),
            Self::HeaderRecords => write!(f, "header-records"),
            Self::Pem => write!(f, "pem"),
        }
    }
}

/// Encode certificates into a flashable region.
pub fn encode_region(certificates: &[Certificate], layout: CertificateLayout) -> Result<Vec<u8>> {
    if layout == CertificateLayout::Pem {
        let blocks: Vec<pem::Pem> = certificates
            .iter()
            .map(|c| pem::Pem::new("CERTIFICATE", c.der().to_vec()))
            .collect();
        let config = pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF);
        return Ok(pem::encode_many_config(&blocks, config).into_bytes());
    }

    let mut region = Vec::new();
    if layout == CertificateLayout::HeaderRecords {
        let count = u32::try_from(certificates.len())
            .map_err(|_| Error::Certificate("too many certificates".into()))?;
        region.extend_from_slice(&START_PATTERN);
        region.write_u32::<LittleEndian>(count)?;
    }

    for certificate in certificates {
        let entry = CertificateEntry::from_der(certificate.der()).map_err(|e| match e {
            Error::Certificate(msg) => Error::Certificate(format!("{}: {msg}", certificate.origin())),
            other => other,
        })?;
        debug!(
            "Encoded {} ({} bytes)",
            certificate.origin(),
            entry.encoded_len()
        );
        region.extend_from_slice(&entry.encode()?);
    }
    Ok(region)
}
