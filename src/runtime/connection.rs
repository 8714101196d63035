//! Per-connection state and the echo read handler.
//!
//! A connection is born Active: registered with a persistent read interest.
//! Each readiness event performs one read and, if bytes arrived, one write
//! of those same bytes. EOF or a read error moves it to Closed, which the
//! loop carries out by deregistering the record and dropping this state.

use crate::runtime::interest::{EventMask, Verdict};
use mio::Token;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{info, trace, warn};

/// A single client connection.
///
/// Owned by its interest record; dropping it closes the socket.
#[derive(Debug)]
pub struct ConnectionState {
    stream: TcpStream,
    peer: SocketAddr,
}

impl ConnectionState {
    /// Wrap an accepted, already non-blocking stream.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }
}

impl AsRawFd for ConnectionState {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Result of one read/echo attempt.
#[derive(Debug)]
pub(crate) enum EchoOutcome {
    /// `read` bytes came in and `written` of them went back out.
    Echoed { read: usize, written: usize },
    /// Nothing to read right now. Would-block and EINTR keep the
    /// connection open; every other read error closes it.
    Idle,
    /// Peer closed its write side.
    Eof,
    /// Read failed.
    Failed(io::Error),
}

/// Read once into `buf` and write whatever arrived back in a single write.
///
/// Bytes the write does not accept are dropped. A failed write counts as a
/// write of zero bytes; the connection's fate is decided by its next read.
pub(crate) fn echo_once<S: Read + Write>(stream: &mut S, buf: &mut [u8]) -> EchoOutcome {
    let n = match stream.read(buf) {
        Ok(0) => return EchoOutcome::Eof,
        Ok(n) => n,
        Err(ref e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted =>
        {
            return EchoOutcome::Idle;
        }
        Err(e) => return EchoOutcome::Failed(e),
    };

    let written = match stream.write(&buf[..n]) {
        Ok(written) => written,
        Err(e) => {
            trace!(error = %e, "Echo write failed");
            0
        }
    };

    EchoOutcome::Echoed { read: n, written }
}

/// Read-readiness callback for a connection.
pub(crate) fn on_read(
    conn: &mut ConnectionState,
    token: Token,
    ready: EventMask,
    buf: &mut [u8],
) -> Verdict {
    trace!(
        conn_id = token.0,
        readable = ready.is_readable(),
        writable = ready.is_writable(),
        "Read event"
    );

    match echo_once(&mut conn.stream, buf) {
        EchoOutcome::Echoed { read, written } => {
            if written < read {
                warn!(
                    conn_id = token.0,
                    read,
                    written,
                    "Short write, not all data echoed back to client"
                );
            }
            Verdict::Keep
        }
        EchoOutcome::Idle => Verdict::Keep,
        EchoOutcome::Eof => {
            info!(conn_id = token.0, peer = %conn.peer, "Client disconnected");
            Verdict::Close
        }
        EchoOutcome::Failed(e) => {
            info!(
                conn_id = token.0,
                peer = %conn.peer,
                error = %e,
                "Socket failure, disconnecting client"
            );
            Verdict::Close
        }
    }
}
