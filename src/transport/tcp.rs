//! CAN-over-TCP transport
//!
//! Owns the socket to the command station. A dedicated reader thread parses
//! 13-byte frames off the stream and routes each one: pending requests get
//! first claim, everything else goes to the event channel.

use super::{await_responses, AwaitSpec, Exchange, PendingTable, Transport};
use crate::can::{CanFrame, FrameReader};
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Socket read timeout; bounds how long the reader thread ignores shutdown
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Connect timeout for the initial socket setup
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct TcpTransport {
    address: String,
    writer: Mutex<Option<TcpStream>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    pending: Arc<PendingTable>,
    events_tx: Sender<CanFrame>,
    events_rx: Receiver<CanFrame>,
    connected: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Create a transport for `host:port`; does not connect yet
    pub fn new(host: &str, port: u16) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            address: format!("{host}:{port}"),
            writer: Mutex::new(None),
            reader_handle: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(PendingTable::new()),
            events_tx,
            events_rx,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn reader_loop(
        mut stream: TcpStream,
        shutdown: Arc<AtomicBool>,
        connected: Arc<AtomicBool>,
        pending: Arc<PendingTable>,
        events_tx: Sender<CanFrame>,
    ) {
        let mut reader = FrameReader::new();

        while !shutdown.load(Ordering::Relaxed) {
            match reader.read_frame(&mut stream) {
                Ok(Some(frame)) => {
                    if !pending.offer(&frame) {
                        let _ = events_tx.send(frame);
                    }
                }
                Ok(None) => {
                    // Read timeout with no complete frame; loop to recheck
                    // the shutdown flag.
                }
                Err(Error::MalformedFrame(msg)) => {
                    warn!("Dropping malformed frame: {}", msg);
                }
                Err(Error::ConnectionClosed) => {
                    info!("Command station closed the connection");
                    connected.store(false, Ordering::Relaxed);
                    break;
                }
                Err(e) => {
                    if !shutdown.load(Ordering::Relaxed) {
                        error!("Socket read error: {}", e);
                        connected.store(false, Ordering::Relaxed);
                    }
                    break;
                }
            }
        }

        debug!("TCP reader thread exiting");
    }
}

impl Transport for TcpTransport {
    fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::Relaxed) {
            return Ok(());
        }

        let addr = self
            .address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidParameter(format!("unresolvable: {}", self.address)))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;

        let read_half = stream.try_clone()?;
        read_half.set_read_timeout(Some(READ_TIMEOUT))?;

        self.shutdown.store(false, Ordering::Relaxed);
        let handle = thread::Builder::new()
            .name("trackio-can-reader".to_string())
            .spawn({
                let shutdown = Arc::clone(&self.shutdown);
                let connected = Arc::clone(&self.connected);
                let pending = Arc::clone(&self.pending);
                let events_tx = self.events_tx.clone();
                move || Self::reader_loop(read_half, shutdown, connected, pending, events_tx)
            })?;

        *self.writer.lock() = Some(stream);
        *self.reader_handle.lock() = Some(handle);
        self.connected.store(true, Ordering::Relaxed);
        info!("Connected to command station at {}", self.address);
        Ok(())
    }

    fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.reader_handle.lock().take() {
            if handle.join().is_err() {
                error!("TCP reader thread panicked");
            }
        }
        // Unblock anyone still parked in send_and_await.
        self.pending.clear();
        self.connected.store(false, Ordering::Relaxed);
    }

    fn send(&self, frame: CanFrame) -> Result<()> {
        let mut guard = self.writer.lock();
        let stream = guard.as_mut().ok_or(Error::NotConnected)?;
        stream.write_all(&frame.encode())?;
        Ok(())
    }

    fn send_and_await(&self, frame: CanFrame, spec: AwaitSpec) -> Exchange {
        let (id, rx) = self.pending.register(frame);
        if let Err(e) = self.send(frame) {
            warn!("Send failed, returning unanswered exchange: {}", e);
            self.pending.complete(id);
            return Exchange {
                request: frame,
                responses: Vec::new(),
            };
        }
        let exchange = await_responses(&rx, frame, spec);
        self.pending.complete(id);
        exchange
    }

    fn events(&self) -> Receiver<CanFrame> {
        self.events_rx.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
