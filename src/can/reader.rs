//! Stream reassembly of CAN frames
//!
//! Frames arrive on the TCP stream back to back with no delimiters, so the
//! reader accumulates bytes in a ring buffer and peels off 13-byte chunks.
//! The stream is frame-aligned, so a slot that fails to decode is dropped
//! whole and the frames behind it parse normally.

use super::frame::{CanFrame, FRAME_SIZE};
use super::ring_buffer::RingBuffer;
use crate::error::{Error, Result};
use std::io::Read;

/// Incremental frame reader over any byte source
pub struct FrameReader {
    buffer: RingBuffer<2048>,
    scratch: [u8; FRAME_SIZE],
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buffer: RingBuffer::new(),
            scratch: [0u8; FRAME_SIZE],
        }
    }

    /// Read from the source and return the next complete frame, if any
    ///
    /// Returns `Ok(None)` when no complete frame is buffered yet (including
    /// read timeouts on a socket with a read deadline). A zero-byte read is
    /// treated as the peer closing the connection. A malformed frame is
    /// consumed and reported as an error; the next call continues with the
    /// frame behind it.
    pub fn read_frame<R: Read>(&mut self, src: &mut R) -> Result<Option<CanFrame>> {
        if let Some(frame) = self.try_parse()? {
            return Ok(Some(frame));
        }

        let mut temp = [0u8; 256];
        match src.read(&mut temp) {
            Ok(0) => Err(Error::ConnectionClosed),
            Ok(n) => {
                self.buffer.extend(&temp[..n]);
                self.try_parse()
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Feed bytes directly (used by the virtual transport and tests)
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes);
    }

    /// Pop the next buffered frame without reading from a source
    pub fn try_parse(&mut self) -> Result<Option<CanFrame>> {
        if !self.buffer.peek_into(&mut self.scratch) {
            return Ok(None);
        }
        match CanFrame::decode(&self.scratch) {
            Ok(frame) => {
                self.buffer.advance(FRAME_SIZE);
                Ok(Some(frame))
            }
            Err(e) => {
                // The stream is frame-aligned, so drop the whole bad slot;
                // the caller logs the error and the frames behind it parse
                // normally.
                self.buffer.advance(FRAME_SIZE);
                Err(e)
            }
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}
