//! Scripted in-memory port used by unit tests.
//!
//! Reads are served from a queue of chunks (one chunk per `read` call at
//! most); an empty queue reads as a timeout, like a quiet serial line.
//! With blocking reads enabled, that timeout takes as long as the port
//! timeout, like a real driver. An optional responder sees every write and
//! may queue a reply.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::port::Port;

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

pub(crate) struct ScriptedPort {
    reads: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    write_calls: usize,
    write_limit: Option<usize>,
    responder: Option<Responder>,
    baud_rate: u32,
    timeout: Duration,
    blocking: bool,
    closes: Arc<AtomicUsize>,
}

impl ScriptedPort {
    pub(crate) fn new() -> Self {
        Self {
            reads: VecDeque::new(),
            written: Vec::new(),
            write_calls: 0,
            write_limit: None,
            responder: None,
            baud_rate: 115_200,
            timeout: Duration::from_millis(10),
            blocking: false,
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn with_baud(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Block for the full port timeout when no data is queued.
    pub(crate) fn with_blocking_reads(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// Accept at most `limit` bytes per `write` call.
    pub(crate) fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    pub(crate) fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    pub(crate) fn push_read(&mut self, data: &[u8]) {
        self.reads.push_back(data.to_vec());
    }

    pub(crate) fn written(&self) -> &[u8] {
        &self.written
    }

    pub(crate) fn write_calls(&self) -> usize {
        self.write_calls
    }

    /// Counter of `close` calls that outlives the port.
    pub(crate) fn closes(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(mut chunk) = self.reads.pop_front() else {
            if self.blocking {
                thread::sleep(self.timeout);
            }
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            chunk.drain(..n);
            self.reads.push_front(chunk);
        }
        Ok(n)
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_calls += 1;
        let n = self.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        self.written.extend_from_slice(&buf[..n]);
        if let Some(responder) = self.responder.as_mut() {
            if let Some(reply) = responder(&buf[..n]) {
                self.reads.push_back(reply);
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for ScriptedPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.reads.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
