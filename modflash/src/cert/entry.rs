//! Binary certificate record consumed by the module firmware.
//!
//! ```text
//! +-----------+--------+--------+------------+-----------+---------+----------+---------+
//! | name SHA1 | modLen | expLen | not before | not after | modulus | exponent | padding |
//! +-----------+--------+--------+------------+-----------+---------+----------+---------+
//! |    20     | u16 LE | u16 LE |     20     |    20     |   m     |    e     |  0xFF   |
//! +-----------+--------+--------+------------+-----------+---------+----------+---------+
//! ```

use byteorder::{LittleEndian, WriteBytesExt};
use sha1::{Digest, Sha1};
use x509_parser::prelude::{ASN1Time, FromDer, X509Certificate};
use x509_parser::public_key::PublicKey;

use crate::error::{Error, Result};

/// Width of each timestamp field.
pub const TIME_FIELD_LEN: usize = 20;

/// Fixed part of every record.
pub const ENTRY_HEADER_LEN: usize = 20 + 2 + 2 + TIME_FIELD_LEN * 2;

/// One root certificate in module format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateEntry {
    /// SHA-1 over the subject attribute values.
    pub name_sha1: [u8; 20],
    /// Start of validity, ASN.1 time body zero-padded.
    pub not_before: [u8; TIME_FIELD_LEN],
    /// End of validity, ASN.1 time body zero-padded.
    pub not_after: [u8; TIME_FIELD_LEN],
    /// RSA modulus, big-endian, no leading zeros.
    pub modulus: Vec<u8>,
    /// RSA public exponent, big-endian, no leading zeros.
    pub exponent: Vec<u8>,
}

impl CertificateEntry {
    /// Convert a DER certificate. Only RSA keys are supported.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Certificate(format!("invalid X.509 data: {e}")))?;

        let mut hasher = Sha1::new();
        for rdn in cert.subject().iter() {
            for attr in rdn.iter() {
                let value = attr.as_str().map_or(attr.attr_value().data, str::as_bytes);
                hasher.update(value);
            }
        }

        let key = cert
            .public_key()
            .parsed()
            .map_err(|e| Error::Certificate(format!("unreadable public key: {e}")))?;
        let PublicKey::RSA(rsa) = key else {
            return Err(Error::Certificate(
                "only RSA public keys can be stored on the module".into(),
            ));
        };

        let validity = cert.validity();
        Ok(Self {
            name_sha1: hasher.finalize().into(),
            not_before: encode_time(&validity.not_before),
            not_after: encode_time(&validity.not_after),
            modulus: strip_leading_zeros(rsa.modulus).to_vec(),
            exponent: strip_leading_zeros(rsa.exponent).to_vec(),
        })
    }

    /// Encoded size including padding.
    pub fn encoded_len(&self) -> usize {
        (ENTRY_HEADER_LEN + self.modulus.len() + self.exponent.len()).next_multiple_of(4)
    }

    /// Serialize the record.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let modulus_len = u16::try_from(self.modulus.len())
            .map_err(|_| Error::Certificate("RSA modulus too long".into()))?;
        let exponent_len = u16::try_from(self.exponent.len())
            .map_err(|_| Error::Certificate("RSA exponent too long".into()))?;

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.name_sha1);
        buf.write_u16::<LittleEndian>(modulus_len)?;
        buf.write_u16::<LittleEndian>(exponent_len)?;
        buf.extend_from_slice(&self.not_before);
        buf.extend_from_slice(&self.not_after);
        buf.extend_from_slice(&self.modulus);
        buf.extend_from_slice(&self.exponent);
        buf.resize(self.encoded_len(), 0xFF);
        Ok(buf)
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// ASN.1 time body: UTCTime for 1950..=2049, GeneralizedTime otherwise.
fn encode_time(time: &ASN1Time) -> [u8; TIME_FIELD_LEN] {
    let dt = time.to_datetime();
    let year = dt.year();
    let body = if (1950..2050).contains(&year) {
        format!(
            "{:02}{:02}{:02}{:02}{:02}{:02}Z",
            year % 100,
            u8::from(dt.month()),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second()
        )
    } else {
        format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}Z",
            year,
            u8::from(dt.month()),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second()
        )
    };

    let mut field = [0u8; TIME_FIELD_LEN];
    let n = body.len().min(TIME_FIELD_LEN);
    field[..n].copy_from_slice(&body.as_bytes()[..n]);
    field
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT_RSA: &[u8] = include_bytes!("../../tests/fixtures/root-rsa.cer");
    const LONG_LIVED: &[u8] = include_bytes!("../../tests/fixtures/long-lived.pem");
    const EC_ROOT: &[u8] = include_bytes!("../../tests/fixtures/ec.pem");

    fn pem_der(data: &[u8]) -> Vec<u8> {
        pem::parse(data).unwrap().into_contents()
    }

    fn field(text: &str) -> [u8; TIME_FIELD_LEN] {
        let mut f = [0u8; TIME_FIELD_LEN];
        f[..text.len()].copy_from_slice(text.as_bytes());
        f
    }

    #[test]
    fn test_rsa_entry_fields() {
        let entry = CertificateEntry::from_der(ROOT_RSA).unwrap();

        let expected: [u8; 20] = Sha1::digest(b"ITModflash TestModflash Test Root").into();
        assert_eq!(entry.name_sha1, expected);
        assert_eq!(entry.not_before, field("200101000000Z"));
        assert_eq!(entry.not_after, field("491231235959Z"));
        assert_eq!(entry.modulus.len(), 128);
        assert_ne!(entry.modulus[0], 0);
        assert_eq!(entry.exponent, vec![0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_entry_layout_and_padding() {
        let entry = CertificateEntry::from_der(ROOT_RSA).unwrap();
        let bytes = entry.encode().unwrap();

        // 20+2+2+20+20+128+3 = 195, padded to 196
        assert_eq!(bytes.len(), 196);
        assert_eq!(&bytes[20..22], &128u16.to_le_bytes());
        assert_eq!(&bytes[22..24], &3u16.to_le_bytes());
        assert_eq!(&bytes[64..192], entry.modulus.as_slice());
        assert_eq!(&bytes[192..195], &[0x01, 0x00, 0x01]);
        assert_eq!(bytes[195], 0xFF);
    }

    #[test]
    fn test_generalized_time_after_2049() {
        let entry = CertificateEntry::from_der(&pem_der(LONG_LIVED)).unwrap();
        assert_eq!(entry.not_before, field("230615120000Z"));
        assert_eq!(entry.not_after, field("20600101000000Z"));
        assert_eq!(entry.modulus.len(), 256);
        // 20+2+2+20+20+256+3 = 323, padded to 324
        assert_eq!(entry.encode().unwrap().len(), 324);
    }

    #[test]
    fn test_entry_size_is_aligned() {
        for (m, e) in [(128, 3), (256, 1), (255, 4), (64, 2), (1, 1)] {
            let entry = CertificateEntry {
                name_sha1: [0; 20],
                not_before: [0; TIME_FIELD_LEN],
                not_after: [0; TIME_FIELD_LEN],
                modulus: vec![0xAB; m],
                exponent: vec![0x03; e],
            };
            let raw = 20 + 2 + 2 + 20 + 20 + m + e;
            let bytes = entry.encode().unwrap();
            assert_eq!(bytes.len(), raw.div_ceil(4) * 4);
            assert!(bytes[raw..].iter().all(|&b| b == 0xFF));
        }
    }

    #[test]
    fn test_non_rsa_rejected() {
        let result = CertificateEntry::from_der(&pem_der(EC_ROOT));
        assert!(matches!(result, Err(Error::Certificate(msg)) if msg.contains("RSA")));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            CertificateEntry::from_der(b"not a certificate"),
            Err(Error::Certificate(_))
        ));
    }

    #[test]
    fn test_strip_leading_zeros() {
        assert_eq!(strip_leading_zeros(&[0, 0, 1, 0]), &[1, 0]);
        assert_eq!(strip_leading_zeros(&[0, 0]), &[] as &[u8]);
    }
}
