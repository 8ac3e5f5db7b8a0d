//! Flash engine for the NINA and WINC1500 flasher bootloader.
//!
//! The host first loads a bridge sketch onto the board; the module's
//! bootloader is then reachable through it with [`CommandFrame`] requests.
//!
//! ```text
//!   host                          module
//!    |  HELLO 0x99                  |
//!    |----------------------------->|
//!    |<------------------- "v10000" |
//!    |  MAX_PAYLOAD_SIZE 0x50       |
//!    |----------------------------->|
//!    |<-------------- u16 BE size   |
//!    |  ERASE 0x03 (offset, len)    |
//!    |----------------------------->|
//!    |<----------------------- "OK" |
//!    |  WRITE 0x02 (chunk) ...      |
//!    |<----------------------- "OK" |
//!    |  verify: READ 0x01 (WINC)    |
//!    |       or CHECKSUM 0x04 (NINA)|
//! ```

use log::{debug, info, trace};
use md5::{Digest, Md5};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::port::{Port, read_before, restore_timeout};
use crate::protocol::frame::CommandFrame;
use crate::target::{Flasher, Module};

/// Smallest payload size the engine accepts from the device.
pub const MIN_PAYLOAD_SIZE: u16 = 1024;

/// Delay between HELLO and reading its reply.
pub const HELLO_DELAY: Duration = Duration::from_millis(100);

/// Expected HELLO reply.
const HELLO_REPLY: &[u8; 6] = b"v10000";

/// Acknowledgment sent after each command.
const ACK: &[u8; 2] = b"OK";

/// HELLO reply read buffer.
const HELLO_BUFFER: usize = 65535;

/// Split `len` bytes into `(offset, size)` steps of at most `chunk` bytes.
///
/// Steps cover `[0, len)` exactly once, in order; only the last one may be
/// shorter than `chunk`.
pub fn chunk_plan(len: usize, chunk: usize) -> Vec<(usize, usize)> {
    let chunk = chunk.max(1);
    (0..len)
        .step_by(chunk)
        .map(|offset| (offset, chunk.min(len - offset)))
        .collect()
}

/// Verification applied after a region is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verify {
    /// Re-read every chunk and compare.
    Readback,
    /// Ask the device for an MD5 of the region.
    Checksum,
    /// Trust the write acks.
    None,
}

/// Bootloader flash engine.
pub struct BootloaderFlasher<P: Port> {
    port: P,
    module: Module,
    payload_size: Option<usize>,
    hello_delay: Duration,
    cancel: CancelToken,
}

impl<P: Port> BootloaderFlasher<P> {
    /// Create an engine for NINA or WINC over an open port.
    pub fn new(port: P, module: Module, cancel: CancelToken) -> Result<Self> {
        if !module.uses_bootloader() {
            return Err(Error::Unsupported(format!(
                "{module} does not use the flasher bootloader"
            )));
        }
        Ok(Self {
            port,
            module,
            payload_size: None,
            hello_delay: HELLO_DELAY,
            cancel,
        })
    }

    /// Override the delay between HELLO and its reply.
    #[must_use]
    pub fn with_hello_delay(mut self, delay: Duration) -> Self {
        self.hello_delay = delay;
        self
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Send HELLO and check the `v10000` reply.
    pub fn handshake(&mut self) -> Result<()> {
        CommandFrame::hello().send(&mut self.port)?;
        self.cancel.sleep(self.hello_delay)?;

        let mut buf = vec![0u8; HELLO_BUFFER];
        let original = self.port.timeout();
        let read = read_before(
            &mut self.port,
            &mut buf,
            Instant::now() + original,
            &self.cancel,
        );
        restore_timeout(&mut self.port, original);
        let n = read?;
        trace!("HELLO reply: {:?}", String::from_utf8_lossy(&buf[..n]));

        // Only the tail matters; earlier bytes are leftovers from the bridge.
        if n < HELLO_REPLY.len() {
            return Err(Error::ProtocolMismatch("Programmer is not responding".into()));
        }
        let reply = &buf[n - HELLO_REPLY.len()..n];
        if reply[0] != b'v' {
            return Err(Error::ProtocolMismatch("Programmer is not responding".into()));
        }
        if reply != HELLO_REPLY {
            return Err(Error::ProtocolMismatch(format!(
                "Programmer version mismatch, v10000 needed: {}",
                String::from_utf8_lossy(reply)
            )));
        }
        Ok(())
    }

    /// Query the largest payload the device accepts per write.
    pub fn max_payload_size(&mut self) -> Result<u16> {
        CommandFrame::max_payload_size().send(&mut self.port)?;
        let mut buf = [0u8; 2];
        self.fill_buffer(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    /// Erase `length` bytes at `address`.
    pub fn erase(&mut self, address: u32, length: u32) -> Result<()> {
        debug!("Erasing {length} bytes at {address:#x}");
        CommandFrame::erase(address, length).send(&mut self.port)?;
        self.expect_ack("erase")
    }

    /// Write `data` at `address`.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        trace!("Writing {} bytes at {address:#x}", data.len());
        CommandFrame::write(address, data)?.send(&mut self.port)?;
        self.expect_ack("write")
    }

    /// Read `length` bytes at `address`.
    pub fn read(&mut self, address: u32, length: u32) -> Result<Vec<u8>> {
        trace!("Reading {length} bytes at {address:#x}");
        CommandFrame::read(address, length).send(&mut self.port)?;
        let mut data = vec![0u8; length as usize];
        self.fill_buffer(&mut data)?;
        self.expect_ack("read")?;
        Ok(data)
    }

    /// Ask the device for the MD5 digest of `length` bytes at `address`.
    pub fn checksum(&mut self, address: u32, length: u32) -> Result<[u8; 16]> {
        CommandFrame::checksum(address, length).send(&mut self.port)?;
        self.expect_ack("checksum")?;
        let mut digest = [0u8; 16];
        self.fill_buffer(&mut digest)?;
        Ok(digest)
    }

    /// Erase once, then write `buffer` at `offset` in payload-sized chunks.
    pub fn flash_chunk(
        &mut self,
        offset: u32,
        buffer: &[u8],
        progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        let chunk = self.require_payload_size()?;
        if buffer.is_empty() {
            return Err(Error::Protocol("nothing to flash".into()));
        }
        let total = buffer.len();

        self.erase(offset, region_len(total)?)?;

        for (start, size) in chunk_plan(total, chunk) {
            self.cancel.check()?;
            let percent = (start * 100 / total) as u8;
            debug!("Flashing chunk: {percent}%");
            progress(percent);
            self.write(offset + start as u32, &buffer[start..start + size])?;
        }
        Ok(())
    }

    /// Re-read the region and compare it with `buffer`.
    pub fn verify_readback(&mut self, offset: u32, buffer: &[u8]) -> Result<()> {
        let chunk = self.require_payload_size()?;
        for (start, size) in chunk_plan(buffer.len(), chunk) {
            self.cancel.check()?;
            let data = self.read(offset + start as u32, size as u32)?;
            let expected = &buffer[start..start + size];
            if let Some(pos) = data.iter().zip(expected).position(|(a, b)| a != b) {
                return Err(Error::VerifyMismatch {
                    offset: offset + (start + pos) as u32,
                });
            }
        }
        debug!("Readback matches {} bytes", buffer.len());
        Ok(())
    }

    /// Compare the device MD5 of the region with the local one.
    pub fn verify_checksum(&mut self, offset: u32, buffer: &[u8]) -> Result<()> {
        let device = self.checksum(offset, region_len(buffer.len())?)?;
        let expected = Md5::digest(buffer);
        let device = hex::encode(device);
        let expected = hex::encode(expected);
        debug!("md5 read from device {device}");
        debug!("md5 of data {expected}");
        if device != expected {
            return Err(Error::IntegrityFailure { device, expected });
        }
        Ok(())
    }

    fn verify(&mut self, mode: Verify, offset: u32, buffer: &[u8]) -> Result<()> {
        match mode {
            Verify::Readback => self.verify_readback(offset, buffer),
            Verify::Checksum => self.verify_checksum(offset, buffer),
            Verify::None => Ok(()),
        }
    }

    fn firmware_verify(&self) -> Verify {
        match self.module {
            Module::Nina => Verify::Checksum,
            _ => Verify::Readback,
        }
    }

    fn certificates_verify(&self) -> Verify {
        match self.module {
            Module::Nina => Verify::None,
            _ => Verify::Readback,
        }
    }

    fn require_payload_size(&self) -> Result<usize> {
        self.payload_size
            .ok_or_else(|| Error::Protocol("handshake has not been performed".into()))
    }

    fn expect_ack(&mut self, operation: &'static str) -> Result<()> {
        let mut ack = [0u8; 2];
        self.fill_buffer(&mut ack)?;
        if &ack != ACK {
            return Err(Error::AckMissing {
                operation,
                received: ack.to_vec(),
            });
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes; a silent line is a timeout.
    ///
    /// Silence is measured against the port timeout, restarting whenever
    /// data arrives.
    fn fill_buffer(&mut self, buf: &mut [u8]) -> Result<()> {
        let original = self.port.timeout();
        let outcome = self.fill_before(buf, original);
        restore_timeout(&mut self.port, original);
        outcome
    }

    fn fill_before(&mut self, buf: &mut [u8], silence: Duration) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let deadline = Instant::now() + silence;
            let n = read_before(&mut self.port, &mut buf[filled..], deadline, &self.cancel)?;
            if n == 0 {
                return Err(Error::Timeout(format!(
                    "read timed out after {filled} of {} bytes",
                    buf.len()
                )));
            }
            filled += n;
        }
        Ok(())
    }
}

impl<P: Port> Flasher for BootloaderFlasher<P> {
    fn module(&self) -> Module {
        self.module
    }

    fn hello(&mut self) -> Result<()> {
        self.handshake()?;
        let size = self.max_payload_size()?;
        if size < MIN_PAYLOAD_SIZE {
            return Err(Error::PayloadTooSmall {
                reported: size,
                required: MIN_PAYLOAD_SIZE,
            });
        }
        info!("{} bootloader ready, payload size {size}", self.module);
        self.payload_size = Some(size as usize);
        Ok(())
    }

    fn payload_size(&self) -> Option<usize> {
        self.payload_size
    }

    fn flash_firmware(&mut self, data: &[u8], progress: &mut dyn FnMut(u8)) -> Result<()> {
        let offset = self.module.firmware_offset();
        info!("Flashing {} bytes of firmware at {offset:#x}", data.len());
        self.flash_chunk(offset, data, progress)?;
        self.verify(self.firmware_verify(), offset, data)?;
        progress(100);
        Ok(())
    }

    fn flash_certificates(&mut self, region: &[u8], progress: &mut dyn FnMut(u8)) -> Result<()> {
        let chunk = self.require_payload_size()?;
        let Some(offset) = self.module.certificates_offset() else {
            return Err(Error::Unsupported(format!(
                "{} has no certificate region",
                self.module
            )));
        };

        let mut data = region.to_vec();
        if let Some(limit) = self.module.certificates_limit() {
            if data.len() > limit {
                return Err(Error::CertificatesTooLarge {
                    size: data.len(),
                    limit,
                });
            }
            // Pad to a whole number of flash pages.
            data.resize(data.len().next_multiple_of(chunk), 0);
        }

        info!("Flashing {} bytes of certificates at {offset:#x}", data.len());
        self.flash_chunk(offset, &data, progress)?;
        self.verify(self.certificates_verify(), offset, &data)?;
        progress(100);
        Ok(())
    }

    fn close(&mut self) {
        if let Err(e) = self.port.close() {
            debug!("Error closing port: {e}");
        }
    }
}

impl<P: Port> Drop for BootloaderFlasher<P> {
    fn drop(&mut self) {
        self.close();
    }
}

fn region_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Protocol(format!("region of {len} bytes is too large")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::ScriptedPort;
    use crate::protocol::frame::Command;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    /// In-memory bootloader answering decoded frames.
    #[derive(Default)]
    struct Device {
        flash: Vec<u8>,
        payload_size: u16,
        erases: Vec<(u32, u32)>,
        writes: Vec<usize>,
        reads: Vec<usize>,
        corrupt_at: Option<usize>,
        bad_digest: bool,
    }

    fn fake_device(payload_size: u16) -> (ScriptedPort, Arc<Mutex<Device>>) {
        let state = Arc::new(Mutex::new(Device {
            flash: vec![0xFF; 0x40000],
            payload_size,
            ..Device::default()
        }));
        let device = Arc::clone(&state);
        let port = ScriptedPort::new().with_responder(move |bytes| {
            let frame = CommandFrame::decode(bytes).unwrap();
            let mut dev = device.lock().unwrap();
            let addr = frame.address() as usize;
            let len = frame.value() as usize;
            match frame.command() {
                Command::Hello => Some(b"v10000".to_vec()),
                Command::MaxPayloadSize => Some(dev.payload_size.to_be_bytes().to_vec()),
                Command::FlashErase => {
                    dev.erases.push((frame.address(), frame.value()));
                    dev.flash[addr..addr + len].fill(0xFF);
                    Some(b"OK".to_vec())
                },
                Command::FlashWrite => {
                    let data = frame.payload();
                    dev.writes.push(data.len());
                    dev.flash[addr..addr + data.len()].copy_from_slice(data);
                    if let Some(pos) = dev.corrupt_at {
                        if (addr..addr + data.len()).contains(&pos) {
                            dev.flash[pos] ^= 0x01;
                        }
                    }
                    Some(b"OK".to_vec())
                },
                Command::FlashRead => {
                    dev.reads.push(len);
                    let mut reply = dev.flash[addr..addr + len].to_vec();
                    reply.extend_from_slice(b"OK");
                    Some(reply)
                },
                Command::Checksum => {
                    let mut digest = Md5::digest(&dev.flash[addr..addr + len]).to_vec();
                    if dev.bad_digest {
                        digest[7] ^= 0x80;
                    }
                    let mut reply = b"OK".to_vec();
                    reply.extend_from_slice(&digest);
                    Some(reply)
                },
            }
        });
        (port, state)
    }

    fn engine(port: ScriptedPort, module: Module) -> BootloaderFlasher<ScriptedPort> {
        let _ = env_logger::builder().is_test(true).try_init();
        BootloaderFlasher::new(port, module, CancelToken::new())
            .unwrap()
            .with_hello_delay(Duration::ZERO)
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_chunk_plan_covers_buffer() {
        for (len, chunk) in [(2560, 1024), (2048, 1024), (1, 1024), (1023, 1), (4097, 4096)] {
            let plan = chunk_plan(len, chunk);
            let mut next = 0;
            for &(offset, size) in &plan {
                assert_eq!(offset, next);
                assert!(size > 0 && size <= chunk);
                next += size;
            }
            assert_eq!(next, len);
            let last = plan.last().unwrap().1;
            let expected = if len % chunk == 0 { chunk } else { len % chunk };
            assert_eq!(last, expected);
        }
        assert!(chunk_plan(0, 1024).is_empty());
    }

    #[test]
    fn test_winc_firmware_2560_bytes() {
        let (port, state) = fake_device(1024);
        let mut flasher = engine(port, Module::Winc);
        flasher.hello().unwrap();
        assert_eq!(flasher.payload_size(), Some(1024));

        let data = image(2560);
        let mut seen = Vec::new();
        flasher
            .flash_firmware(&data, &mut |p| seen.push(p))
            .unwrap();

        let dev = state.lock().unwrap();
        assert_eq!(dev.erases, vec![(0, 2560)]);
        assert_eq!(dev.writes, vec![1024, 1024, 512]);
        assert_eq!(dev.reads, vec![1024, 1024, 512]);
        assert_eq!(&dev.flash[..2560], data.as_slice());
        assert_eq!(seen, vec![0, 40, 80, 100]);
    }

    #[test]
    fn test_winc_readback_mismatch() {
        let (port, state) = fake_device(1024);
        state.lock().unwrap().corrupt_at = Some(1500);
        let mut flasher = engine(port, Module::Winc);
        flasher.hello().unwrap();

        let result = flasher.flash_firmware(&image(2560), &mut |_| {});
        assert!(matches!(result, Err(Error::VerifyMismatch { offset: 1500 })));
    }

    #[test]
    fn test_nina_checksum_match_and_mismatch() {
        let (port, _state) = fake_device(4096);
        let mut flasher = engine(port, Module::Nina);
        flasher.hello().unwrap();
        flasher.flash_firmware(&image(10_000), &mut |_| {}).unwrap();

        let (port, state) = fake_device(4096);
        state.lock().unwrap().bad_digest = true;
        let mut flasher = engine(port, Module::Nina);
        flasher.hello().unwrap();
        let data = image(10_000);
        match flasher.flash_firmware(&data, &mut |_| {}) {
            Err(Error::IntegrityFailure { device, expected }) => {
                assert_eq!(expected, hex::encode(Md5::digest(&data)));
                assert_eq!(device.len(), 32);
                assert_ne!(device, expected);
            },
            other => panic!("expected IntegrityFailure, got {other:?}"),
        }
        assert!(state.lock().unwrap().reads.is_empty());
    }

    #[test]
    fn test_nina_certificates_padded_to_page() {
        let (port, state) = fake_device(1024);
        let mut flasher = engine(port, Module::Nina);
        flasher.hello().unwrap();
        flasher.flash_certificates(&[0xAB; 1500], &mut |_| {}).unwrap();

        let dev = state.lock().unwrap();
        assert_eq!(dev.erases, vec![(0x10000, 2048)]);
        assert_eq!(dev.writes, vec![1024, 1024]);
        assert!(dev.reads.is_empty());
        assert_eq!(dev.flash[0x10000 + 1499], 0xAB);
        assert_eq!(dev.flash[0x10000 + 1500], 0x00);
    }

    #[test]
    fn test_nina_certificates_over_limit() {
        let (port, _state) = fake_device(1024);
        let mut flasher = engine(port, Module::Nina);
        flasher.hello().unwrap();
        let result = flasher.flash_certificates(&vec![0u8; 0x20001], &mut |_| {});
        assert!(matches!(
            result,
            Err(Error::CertificatesTooLarge { size: 0x20001, limit: 0x20000 })
        ));
    }

    #[test]
    fn test_winc_certificates_at_offset() {
        let (port, state) = fake_device(1024);
        let mut flasher = engine(port, Module::Winc);
        flasher.hello().unwrap();
        flasher.flash_certificates(&[0x5A; 300], &mut |_| {}).unwrap();

        let dev = state.lock().unwrap();
        assert_eq!(dev.erases, vec![(0x4000, 300)]);
        assert_eq!(dev.reads, vec![300]);
    }

    #[test]
    fn test_hello_keeps_last_six_bytes() {
        let mut port = ScriptedPort::new();
        port.push_read(b"garbage\r\nv10000");
        let mut flasher = engine(port, Module::Winc);
        flasher.handshake().unwrap();
        assert_eq!(flasher.port().written(), CommandFrame::hello().encode().as_slice());
    }

    #[test]
    fn test_hello_failures() {
        let mut flasher = engine(ScriptedPort::new(), Module::Nina);
        assert!(matches!(
            flasher.handshake(),
            Err(Error::ProtocolMismatch(msg)) if msg.contains("not responding")
        ));

        let mut port = ScriptedPort::new();
        port.push_read(b"v1");
        let mut flasher = engine(port, Module::Nina);
        assert!(matches!(flasher.handshake(), Err(Error::ProtocolMismatch(_))));

        let mut port = ScriptedPort::new();
        port.push_read(b"v20000");
        let mut flasher = engine(port, Module::Nina);
        assert!(matches!(
            flasher.handshake(),
            Err(Error::ProtocolMismatch(msg)) if msg.contains("version mismatch")
        ));
    }

    #[test]
    fn test_payload_too_small() {
        let (port, _state) = fake_device(512);
        let mut flasher = engine(port, Module::Winc);
        assert!(matches!(
            flasher.hello(),
            Err(Error::PayloadTooSmall { reported: 512, required: 1024 })
        ));
    }

    #[test]
    fn test_missing_ack() {
        let mut port = ScriptedPort::new();
        port.push_read(b"KO");
        let mut flasher = engine(port, Module::Winc);
        flasher.payload_size = Some(1024);
        assert!(matches!(
            flasher.erase(0, 16),
            Err(Error::AckMissing { operation: "erase", .. })
        ));
    }

    #[test]
    fn test_silent_read_is_timeout() {
        let mut flasher = engine(ScriptedPort::new(), Module::Winc);
        assert!(matches!(flasher.read(0, 8), Err(Error::Timeout(_))));
    }

    #[test]
    fn test_silent_read_is_cancellable() {
        let mut port = ScriptedPort::new().with_blocking_reads();
        port.set_timeout(Duration::from_secs(3)).unwrap();
        let cancel = CancelToken::new();
        let mut flasher = BootloaderFlasher::new(port, Module::Winc, cancel.clone()).unwrap();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });

        let start = Instant::now();
        let result = flasher.read(0, 8);
        handle.join().unwrap();

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(flasher.port().timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_silent_handshake_waits_port_timeout() {
        let mut port = ScriptedPort::new().with_blocking_reads();
        port.set_timeout(Duration::from_millis(150)).unwrap();
        let mut flasher = engine(port, Module::Nina);

        let start = Instant::now();
        assert!(matches!(flasher.handshake(), Err(Error::ProtocolMismatch(_))));
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(flasher.port().timeout(), Duration::from_millis(150));
    }

    #[test]
    fn test_port_closed_once_after_failed_hello() {
        let port = ScriptedPort::new();
        let closes = port.closes();
        let mut flasher = engine(port, Module::Winc);
        assert!(flasher.hello().is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        drop(flasher);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flash_before_hello_rejected() {
        let mut flasher = engine(ScriptedPort::new(), Module::Winc);
        assert!(matches!(
            flasher.flash_firmware(&[1, 2, 3], &mut |_| {}),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_sara_rejected() {
        let result = BootloaderFlasher::new(ScriptedPort::new(), Module::Sara, CancelToken::new());
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_cancel_between_chunks() {
        let (port, state) = fake_device(1024);
        let cancel = CancelToken::new();
        let mut flasher = BootloaderFlasher::new(port, Module::Winc, cancel.clone())
            .unwrap()
            .with_hello_delay(Duration::ZERO);
        flasher.hello().unwrap();

        let result = flasher.flash_firmware(&image(4096), &mut |p| {
            if p >= 25 {
                cancel.cancel();
            }
        });
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(state.lock().unwrap().writes.len(), 2);
    }
}
