//! # Server Connection
//!
//! Purpose: Own one lazily-established TCP session to one server, with the
//! buffers and bookkeeping the executor needs for every delivery mode.
//!
//! ## Design Principles
//! 1. **Single Owner**: A connection belongs to exactly one client instance
//!    and is never shared; clones open their own.
//! 2. **Lazy Connect**: The socket is opened on first use and reopened after
//!    any I/O or framing failure.
//! 3. **Cache-Friendly Buffers**: Line and queue buffers are reused.
//! 4. **Fail Fast on Dead Servers**: A failed connect marks the server dead
//!    for `retry_timeout`.

use std::collections::VecDeque;
use std::io::{self, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ClientResult, Error, Operation};
use crate::protocol::{read_reply, Reply, WireError};
use crate::server::ServerAddress;

/// Socket options shared by every connection of a client.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionOptions {
    pub connect_timeout: Option<Duration>,
    pub io_timeout: Option<Duration>,
    pub retry_timeout: Duration,
    pub tcp_nodelay: bool,
}

/// A reply the server owes for a command already queued or written.
#[derive(Debug, Clone)]
pub(crate) struct PendingReply {
    pub op: Operation,
    pub key: String,
}

/// Single server session with reusable buffers.
pub(crate) struct Connection {
    addr: ServerAddress,
    // Buffered reader reduces syscalls while still allowing direct writes.
    stream: Option<BufReader<TcpStream>>,
    line_buf: Vec<u8>,
    dead_until: Option<Instant>,
    /// Commands encoded but not yet written (buffered mode).
    pub queued: Vec<u8>,
    /// Replies owed for queued or written commands, oldest first.
    pub pending: VecDeque<PendingReply>,
    /// First failure observed while draining buffered replies.
    pub deferred: Option<Error>,
    /// Further failures dropped since `deferred` was set.
    pub suppressed: usize,
}

impl Connection {
    pub(crate) fn new(addr: ServerAddress) -> Self {
        Connection {
            addr,
            stream: None,
            line_buf: Vec::with_capacity(128),
            dead_until: None,
            queued: Vec::new(),
            pending: VecDeque::new(),
            deferred: None,
            suppressed: 0,
        }
    }

    pub(crate) fn addr(&self) -> &ServerAddress {
        &self.addr
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Writes `bytes` to the server, connecting first if needed.
    pub(crate) fn write(
        &mut self,
        options: &ConnectionOptions,
        op: Operation,
        key: &str,
        bytes: &[u8],
    ) -> ClientResult<()> {
        self.ensure_connected(options, op, key)?;
        let result = match self.stream.as_mut() {
            Some(reader) => write_all(reader.get_mut(), bytes),
            None => Err(not_connected()),
        };
        result.map_err(|err| {
            self.reset();
            Error::from_io(op, key, &err)
        })
    }

    /// Reads one reply item from the server.
    pub(crate) fn read(&mut self, op: Operation, key: &str) -> ClientResult<Reply> {
        let result = match self.stream.as_mut() {
            Some(reader) => read_reply(reader, &mut self.line_buf),
            None => Err(WireError::Io(not_connected())),
        };
        result.map_err(|err| {
            // The stream position is unknown after a failed read.
            self.reset();
            match err {
                WireError::Io(err) => Error::from_io(op, key, &err),
                WireError::Malformed(message) => Error::Protocol {
                    op,
                    key: key.to_owned(),
                    message: message.to_string(),
                },
            }
        })
    }

    /// Drops the socket along with any replies it still owed.
    pub(crate) fn reset(&mut self) {
        if self.stream.take().is_some() {
            debug!(server = %self.addr, "connection closed");
        }
        if !self.pending.is_empty() {
            warn!(
                server = %self.addr,
                lost = self.pending.len(),
                "discarding replies owed by closed connection"
            );
            self.pending.clear();
        }
        self.queued.clear();
    }

    /// Keeps the first deferred failure; later ones are only counted.
    pub(crate) fn defer(&mut self, err: Error) {
        if self.deferred.is_none() {
            self.deferred = Some(err);
        } else {
            self.suppressed += 1;
        }
    }

    /// Takes the retained failure and logs how many were dropped behind it.
    pub(crate) fn take_deferred(&mut self) -> Option<Error> {
        if self.suppressed > 0 {
            warn!(
                server = %self.addr,
                suppressed = self.suppressed,
                "further deferred failures were dropped"
            );
            self.suppressed = 0;
        }
        self.deferred.take()
    }

    fn ensure_connected(&mut self, options: &ConnectionOptions, op: Operation, key: &str) -> ClientResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        if let Some(until) = self.dead_until {
            if Instant::now() < until {
                return Err(Error::Server {
                    op,
                    key: key.to_owned(),
                    message: format!("server {} is marked dead", self.addr),
                });
            }
            self.dead_until = None;
        }

        match connect_stream(&self.addr, options) {
            Ok(stream) => {
                debug!(server = %self.addr, "connected");
                self.stream = Some(BufReader::new(stream));
                Ok(())
            }
            Err(err) => {
                if !options.retry_timeout.is_zero() {
                    warn!(
                        server = %self.addr,
                        retry_in = ?options.retry_timeout,
                        error = %err,
                        "connect failed; marking server dead"
                    );
                    self.dead_until = Some(Instant::now() + options.retry_timeout);
                }
                Err(Error::from_io(op, key, &err))
            }
        }
    }
}

fn connect_stream(addr: &ServerAddress, options: &ConnectionOptions) -> io::Result<TcpStream> {
    let mut last_err = None;
    for socket_addr in (addr.hostname(), addr.port()).to_socket_addrs()? {
        let attempt = match options.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&socket_addr, timeout),
            None => TcpStream::connect(socket_addr),
        };
        match attempt {
            Ok(stream) => {
                stream.set_read_timeout(options.io_timeout)?;
                stream.set_write_timeout(options.io_timeout)?;
                // Disable Nagle to keep request latency low for small payloads.
                stream.set_nodelay(options.tcp_nodelay)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{addr} did not resolve"))
    }))
}

fn write_all(stream: &mut TcpStream, bytes: &[u8]) -> io::Result<()> {
    stream.write_all(bytes)?;
    stream.flush()
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is not established")
}
