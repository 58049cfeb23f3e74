//! # Stream Framing
//!
//! Turns a partial-read byte stream into whole messages.
//!
//! ## Design
//!
//! - [`FrameBuffer`] is transport-agnostic; the host feeds it from a tokio
//!   read half, the client from a non-blocking std socket
//! - A bad line is skipped, the rest of the buffer keeps flowing
//! - Bytes buffered without a newline are capped, so a peer cannot grow the
//!   buffer without bound

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{NetError, NetResult};
use crate::protocol::{decode, encode, Message};

const READ_CHUNK: usize = 8192;

/// Receive buffer splitting bytes on `\n`.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame_bytes: usize,
    dropped: u64,
}

impl FrameBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(READ_CHUNK),
            max_frame_bytes,
            dropped: 0,
        }
    }

    /// Appends bytes and returns every message completed by them.
    ///
    /// # Errors
    ///
    /// Returns `NetError::FrameTooLarge` when more than `max_frame_bytes`
    /// remain buffered without a delimiter. The buffer is cleared.
    pub fn extend(&mut self, bytes: &[u8]) -> NetResult<Vec<Message>> {
        self.buf.extend_from_slice(bytes);

        let mut messages = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let line = &self.buf[start..start + offset];
            start += offset + 1;

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match decode(line) {
                Some(msg) => messages.push(msg),
                None => {
                    self.dropped += 1;
                    debug!(bytes = line.len(), "dropping undecodable frame");
                }
            }
        }
        self.buf.drain(..start);

        if self.buf.len() > self.max_frame_bytes {
            let len = self.buf.len();
            self.buf.clear();
            return Err(NetError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        Ok(messages)
    }

    /// Bytes waiting for a delimiter.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if no partial frame is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Lines discarded because they did not decode.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// One non-blocking stream to a peer.
///
/// Used by the client engine. Reads never block; writes retry until the
/// configured write deadline.
#[derive(Debug)]
pub struct Connection {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    frames: FrameBuffer,
    write_timeout: Duration,
    last_activity: Instant,
    eof: bool,
}

impl Connection {
    /// Opens a stream to `host:port`, trying each resolved address in turn.
    ///
    /// # Errors
    ///
    /// Returns `NetError::Io` if resolution fails or no address accepts
    /// within `connect_timeout`.
    pub fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        write_timeout: Duration,
        max_frame_bytes: usize,
    ) -> NetResult<Self> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => return Self::from_stream(stream, write_timeout, max_frame_bytes),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))
            .into())
    }

    /// Wraps an already connected stream and switches it to non-blocking.
    ///
    /// # Errors
    ///
    /// Returns `NetError::Io` if the socket options cannot be set.
    pub fn from_stream(stream: TcpStream, write_timeout: Duration, max_frame_bytes: usize) -> NetResult<Self> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream: Some(stream),
            peer,
            frames: FrameBuffer::new(max_frame_bytes),
            write_timeout,
            last_activity: Instant::now(),
            eof: false,
        })
    }

    /// Reads whatever is available and returns the completed messages.
    ///
    /// An empty vector means nothing complete has arrived yet.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once the peer has closed and every message sent
    /// before the close has been returned; `Io` or `FrameTooLarge` on
    /// transport failure.
    pub fn read_messages(&mut self) -> NetResult<Vec<Message>> {
        if self.eof {
            return Err(NetError::ConnectionClosed);
        }
        let stream = self.stream.as_mut().ok_or(NetError::ConnectionClosed)?;

        let mut messages = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    if messages.is_empty() {
                        return Err(NetError::ConnectionClosed);
                    }
                    break;
                }
                Ok(n) => {
                    self.last_activity = Instant::now();
                    messages.extend(self.frames.extend(&chunk[..n])?);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(messages)
    }

    /// Encodes and writes one message.
    ///
    /// # Errors
    ///
    /// As [`Connection::send_frame`].
    pub fn send(&mut self, msg: &Message, compress: bool) -> NetResult<()> {
        let frame = encode(msg, compress)?;
        self.send_frame(&frame)
    }

    /// Writes one encoded frame, retrying `WouldBlock` until the deadline.
    ///
    /// # Errors
    ///
    /// `Timeout` if the deadline passes, `ConnectionClosed` if the stream is
    /// closed, `Io` otherwise. A partial write leaves the stream unusable.
    pub fn send_frame(&mut self, frame: &[u8]) -> NetResult<()> {
        let stream = self.stream.as_mut().ok_or(NetError::ConnectionClosed)?;
        let deadline = Instant::now() + self.write_timeout;

        let mut written = 0;
        while written < frame.len() {
            match stream.write(&frame[written..]) {
                Ok(0) => return Err(NetError::ConnectionClosed),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(NetError::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Shuts the stream down. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Returns true until [`Connection::close`] is called.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Remote address.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Time since bytes last arrived.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Lines dropped as undecodable.
    #[must_use]
    pub const fn dropped_frames(&self) -> u64 {
        self.frames.dropped()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
