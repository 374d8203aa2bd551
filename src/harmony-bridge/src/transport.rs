//! TCP connection to the peer application.
//!
//! The peer listens; this side connects. All operations are bounded blocking
//! calls meant to be driven from a single thread.

use socket2::SockRef;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use thiserror::Error;

const READ_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to resolve {endpoint}: {source}")]
    Resolve { endpoint: String, source: io::Error },
    #[error("{endpoint} did not resolve to any address")]
    NoAddress { endpoint: String },
    #[error("failed to connect to {endpoint}: {source}")]
    ConnectFailed { endpoint: String, source: io::Error },
    #[error("failed to configure socket: {0}")]
    SocketOption(io::Error),
    #[error("not connected")]
    NotConnected,
    /// With `written > 0` the connection has been dropped, since the peer
    /// holds a truncated frame.
    #[error("timed out after writing {written} of {len} bytes ({timeout:?})")]
    WriteTimeout {
        len: usize,
        written: usize,
        timeout: Duration,
    },
    #[error("failed to write to peer: {0}")]
    Write(io::Error),
    #[error("failed to read from peer: {0}")]
    Read(io::Error),
}

/// Lifecycle of the single physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Unconnected => "unconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(label)
    }
}

/// Bytes drained by one read pass.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub bytes: Vec<u8>,
    /// The peer closed the connection during this pass.
    pub closed: bool,
}

/// Byte stream the client speaks the protocol over.
pub trait Transport {
    /// Open the connection, aborting any existing one first.
    fn connect(&mut self) -> Result<(), TransportError>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Write a whole frame, waiting at most the configured write timeout.
    /// A frame cut short by a failure drops the connection.
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for data, then drain whatever is available
    /// without blocking again.
    fn read_available(&mut self, timeout: Duration) -> Result<ReadOutcome, TransportError>;

    /// Drop the connection immediately, without a graceful shutdown.
    fn abort(&mut self);
}

/// Timeouts applied by [`TcpTransport`].
#[derive(Debug, Clone, Copy)]
pub struct TcpOptions {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1500),
            write_timeout: Duration::from_secs(10),
        }
    }
}

pub struct TcpTransport {
    host: String,
    port: u16,
    options: TcpOptions,
    stream: Option<TcpStream>,
    state: ConnectionState,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16, options: TcpOptions) -> Self {
        Self {
            host: host.into(),
            port,
            options,
            stream: None,
            state: ConnectionState::Unconnected,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>, TransportError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| TransportError::Resolve {
                endpoint: self.endpoint(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(TransportError::NoAddress {
                endpoint: self.endpoint(),
            });
        }
        Ok(addrs)
    }

    fn open(&self, addrs: &[SocketAddr]) -> Result<TcpStream, TransportError> {
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(addr, self.options.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connection attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(TransportError::ConnectFailed {
            endpoint: self.endpoint(),
            source: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address")),
        })
    }

    fn mark_closed(&mut self) {
        self.stream = None;
        self.state = ConnectionState::Unconnected;
    }
}

fn configure(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            tracing::warn!(
                endpoint = %self.endpoint(),
                "connection already existed, removing connection"
            );
            self.abort();
        }

        let addrs = self.resolve()?;
        self.state = ConnectionState::Connecting;
        let started = Instant::now();
        let stream = match self.open(&addrs) {
            Ok(stream) => stream,
            Err(e) => {
                self.state = ConnectionState::Unconnected;
                tracing::error!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "error connecting to the server"
                );
                return Err(e);
            }
        };

        if let Err(e) = configure(&stream) {
            self.state = ConnectionState::Unconnected;
            return Err(TransportError::SocketOption(e));
        }

        tracing::debug!(
            endpoint = %self.endpoint(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "connected"
        );
        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let timeout = self.options.write_timeout;
        let deadline = Instant::now() + timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        let mut written = 0;
        let failure = loop {
            if written == frame.len() {
                break stream.flush().err();
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Some(io::Error::from(io::ErrorKind::TimedOut));
            }
            stream
                .set_write_timeout(Some(remaining))
                .map_err(TransportError::SocketOption)?;
            match stream.write(&frame[written..]) {
                Ok(0) => break Some(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Some(e),
            }
        };
        let Some(e) = failure else {
            return Ok(());
        };

        // a partial frame leaves the peer's decoder mid-payload
        if written > 0 {
            tracing::error!(
                written,
                len = frame.len(),
                error = %e,
                "frame cut short, dropping connection"
            );
            self.abort();
        } else if is_disconnect(&e) {
            self.mark_closed();
        }

        if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) {
            return Err(TransportError::WriteTimeout {
                len: frame.len(),
                written,
                timeout,
            });
        }
        Err(TransportError::Write(e))
    }

    fn read_available(&mut self, timeout: Duration) -> Result<ReadOutcome, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let mut outcome = ReadOutcome::default();
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        if !timeout.is_zero() {
            stream
                .set_read_timeout(Some(timeout))
                .map_err(TransportError::SocketOption)?;
            match stream.read(&mut chunk) {
                Ok(0) => outcome.closed = true,
                Ok(n) => outcome.bytes.extend_from_slice(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    return Ok(outcome);
                }
                Err(e) => {
                    if is_disconnect(&e) {
                        self.mark_closed();
                    }
                    return Err(TransportError::Read(e));
                }
            }
        }

        if !outcome.closed {
            stream
                .set_nonblocking(true)
                .map_err(TransportError::SocketOption)?;
            let drained = loop {
                match stream.read(&mut chunk) {
                    Ok(0) => {
                        outcome.closed = true;
                        break Ok(());
                    }
                    Ok(n) => outcome.bytes.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break Err(e),
                }
            };
            let restored = stream.set_nonblocking(false);
            if let Err(e) = drained {
                if is_disconnect(&e) {
                    self.mark_closed();
                }
                return Err(TransportError::Read(e));
            }
            restored.map_err(TransportError::SocketOption)?;
        }

        if outcome.closed {
            tracing::warn!(endpoint = %self.endpoint(), "host closed the connection");
            self.mark_closed();
        }
        Ok(outcome)
    }

    fn abort(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.state = ConnectionState::Closing;
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.state = ConnectionState::Unconnected;
    }
}

fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
