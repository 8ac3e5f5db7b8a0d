//! Binary command frames for the NINA/WINC flasher bootloader.
//!
//! ## Frame Format
//!
//! Every request shares one big-endian layout:
//!
//! ```text
//! +---------+-----------+-----------+----------+-------------------+
//! | Command |  Address  |   Value   |  Length  |      Payload      |
//! +---------+-----------+-----------+----------+-------------------+
//! | 1 byte  |  4 bytes  |  4 bytes  |  2 bytes |  `Length` bytes   |
//! +---------+-----------+-----------+----------+-------------------+
//! ```
//!
//! Replies are not framed: the device answers with raw bytes (`OK`, a
//! version string, a digest) that the engine reads with exact lengths.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::trace;
use std::io::Cursor;

use crate::error::{Error, Result};
use crate::port::Port;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 11;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// HELLO address magic.
pub const HELLO_ADDRESS: u32 = 0x1122_3344;

/// HELLO value magic.
pub const HELLO_VALUE: u32 = 0x5566_7788;

/// Bootloader command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Read a flash range (0x01).
    FlashRead = 0x01,
    /// Write a payload to flash (0x02).
    FlashWrite = 0x02,
    /// Erase a flash range (0x03).
    FlashErase = 0x03,
    /// MD5 over a flash range (0x04).
    Checksum = 0x04,
    /// Query the largest accepted payload (0x50).
    MaxPayloadSize = 0x50,
    /// Handshake (0x99).
    Hello = 0x99,
}

impl Command {
    /// Decode a command byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::FlashRead),
            0x02 => Some(Self::FlashWrite),
            0x03 => Some(Self::FlashErase),
            0x04 => Some(Self::Checksum),
            0x50 => Some(Self::MaxPayloadSize),
            0x99 => Some(Self::Hello),
            _ => None,
        }
    }
}

/// A single bootloader request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    command: Command,
    address: u32,
    value: u32,
    payload: Vec<u8>,
}

impl CommandFrame {
    /// Build a frame, rejecting payloads the length field cannot describe.
    pub fn new(command: Command, address: u32, value: u32, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "payload of {} bytes exceeds frame limit of {MAX_PAYLOAD_LEN}",
                payload.len()
            )));
        }
        Ok(Self {
            command,
            address,
            value,
            payload,
        })
    }

    fn bare(command: Command, address: u32, value: u32) -> Self {
        Self {
            command,
            address,
            value,
            payload: Vec::new(),
        }
    }

    /// HELLO handshake frame.
    pub fn hello() -> Self {
        Self::bare(Command::Hello, HELLO_ADDRESS, HELLO_VALUE)
    }

    /// Maximum payload size query.
    pub fn max_payload_size() -> Self {
        Self::bare(Command::MaxPayloadSize, 0, 0)
    }

    /// Erase `length` bytes starting at `address`.
    pub fn erase(address: u32, length: u32) -> Self {
        Self::bare(Command::FlashErase, address, length)
    }

    /// Write `data` at `address`.
    pub fn write(address: u32, data: &[u8]) -> Result<Self> {
        Self::new(Command::FlashWrite, address, 0, data.to_vec())
    }

    /// Read `length` bytes from `address`.
    pub fn read(address: u32, length: u32) -> Self {
        Self::bare(Command::FlashRead, address, length)
    }

    /// MD5 over `length` bytes from `address`.
    pub fn checksum(address: u32, length: u32) -> Self {
        Self::bare(Command::Checksum, address, length)
    }

    /// Command code.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Address field.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Value field.
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encode into wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        // Writes to a Vec cannot fail; the length fits by construction.
        buf.push(self.command as u8);
        let _ = buf.write_u32::<BigEndian>(self.address);
        let _ = buf.write_u32::<BigEndian>(self.value);
        let _ = buf.write_u16::<BigEndian>(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse wire bytes produced by [`CommandFrame::encode`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Protocol(format!(
                "frame too short: {} bytes, header needs {HEADER_LEN}",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let code = cursor.read_u8()?;
        let command = Command::from_byte(code)
            .ok_or_else(|| Error::Protocol(format!("unknown command byte {code:#04x}")))?;
        let address = cursor.read_u32::<BigEndian>()?;
        let value = cursor.read_u32::<BigEndian>()?;
        let length = cursor.read_u16::<BigEndian>()? as usize;

        let payload = &data[HEADER_LEN..];
        if payload.len() != length {
            return Err(Error::Protocol(format!(
                "length field says {length} bytes, frame carries {}",
                payload.len()
            )));
        }

        Ok(Self {
            command,
            address,
            value,
            payload: payload.to_vec(),
        })
    }

    /// Encode and write the whole frame to `port`.
    pub fn send<P: Port + ?Sized>(&self, port: &mut P) -> Result<()> {
        let data = self.encode();
        trace!(
            "TX {:?} addr={:#010x} value={:#010x} len={}",
            self.command,
            self.address,
            self.value,
            self.payload.len()
        );
        port.write_all_bytes(&data)
    }
}
