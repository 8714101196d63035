//! Listening socket setup and the connection manager.
//!
//! The listener is registered once with a persistent read interest and
//! stays registered for the life of the process. Each accept-readiness
//! event takes at most one client off the backlog; the loop re-arms the
//! listener, so any remaining backlog fires again on the next cycle.

use crate::runtime::connection::ConnectionState;
use crate::runtime::event_loop::{EventLoop, LoopError};
use crate::runtime::interest::{EventMask, Handler, Verdict};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, SocketAddrV4, TcpListener};
use std::os::unix::io::AsRawFd;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Listener setup failures, one per stage.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("socket failed: {0}")]
    Socket(#[source] io::Error),
    #[error("setting SO_REUSEADDR failed: {0}")]
    ReuseAddr(#[source] io::Error),
    #[error("bind to {addr} failed: {source}")]
    Bind { addr: SocketAddrV4, source: io::Error },
    #[error("listen failed: {0}")]
    Listen(#[source] io::Error),
    #[error("failed to set server socket to non-blocking: {0}")]
    NonBlocking(#[source] io::Error),
    #[error("failed to register listener: {0}")]
    Register(#[source] LoopError),
}

/// The listening socket, owned by its interest record.
#[derive(Debug)]
pub struct ListenerState {
    listener: TcpListener,
}

/// Bind and listen on `addr`, then register the persistent accept interest.
///
/// Returns the bound address, which differs from `addr` when port 0 is
/// requested.
pub fn start_listening(
    event_loop: &mut EventLoop,
    addr: SocketAddrV4,
    backlog: i32,
) -> Result<SocketAddr, StartupError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(StartupError::Socket)?;
    socket
        .set_reuse_address(true)
        .map_err(StartupError::ReuseAddr)?;
    socket
        .bind(&SocketAddr::V4(addr).into())
        .map_err(|source| StartupError::Bind { addr, source })?;
    socket.listen(backlog).map_err(StartupError::Listen)?;
    socket
        .set_nonblocking(true)
        .map_err(StartupError::NonBlocking)?;

    let listener: TcpListener = socket.into();
    let local_addr = listener.local_addr().map_err(StartupError::Socket)?;
    let fd = listener.as_raw_fd();

    event_loop
        .register(
            fd,
            EventMask::READ,
            true,
            Handler::Accept(ListenerState { listener }),
        )
        .map_err(StartupError::Register)?;

    info!(addr = %local_addr, backlog, "Listening");
    Ok(local_addr)
}

/// Accept-readiness callback.
///
/// Accept faults are logged and absorbed. Only a failure to register the
/// new connection with the notifier propagates, as a loop fault.
pub(crate) fn on_accept(
    event_loop: &mut EventLoop,
    state: &mut ListenerState,
) -> Result<Verdict, LoopError> {
    let (stream, peer) = match state.listener.accept() {
        Ok(accepted) => accepted,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Verdict::Keep),
        Err(e) if is_descriptor_exhaustion(&e) => {
            error!(error = %e, "Accept failed, out of descriptors");
            return Ok(Verdict::Keep);
        }
        Err(e) => {
            warn!(error = %e, "Accept failed");
            return Ok(Verdict::Keep);
        }
    };

    if let Err(e) = stream.set_nonblocking(true) {
        warn!(peer = %peer, error = %e, "Failed to set client socket non-blocking");
        return Ok(Verdict::Keep);
    }

    let conn = ConnectionState::new(stream, peer);
    let fd = conn.as_raw_fd();
    let token = event_loop.register(fd, EventMask::READ, true, Handler::Read(conn))?;

    info!(conn_id = token.0, peer = %peer.ip(), "Accepted connection");
    debug!(interests = event_loop.len(), "Registry size");
    Ok(Verdict::Keep)
}

fn is_descriptor_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};
    use std::time::Duration;

    const TURN: Duration = Duration::from_millis(10);
    const MAX_TURNS: usize = 1000;

    fn server() -> (EventLoop, SocketAddr) {
        let mut event_loop = EventLoop::new(64, 8196).unwrap();
        let addr = start_listening(
            &mut event_loop,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            5,
        )
        .unwrap();
        (event_loop, addr)
    }

    fn turn_until(event_loop: &mut EventLoop, mut done: impl FnMut(&EventLoop) -> bool) {
        for _ in 0..MAX_TURNS {
            if done(event_loop) {
                return;
            }
            event_loop.turn(Some(TURN)).unwrap();
        }
        panic!("event loop never reached the expected state");
    }

    /// Connect a client and drive the loop until it has been accepted.
    fn connect(event_loop: &mut EventLoop, addr: SocketAddr) -> TcpStream {
        let before = event_loop.len();
        let client = TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        turn_until(event_loop, |el| el.len() == before + 1);
        client
    }

    /// Send `payload` and collect the echo, driving the loop in between.
    fn exchange(event_loop: &mut EventLoop, client: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
        let mut sent = 0;
        let mut received = Vec::with_capacity(payload.len());
        let mut buf = [0u8; 16 * 1024];

        for _ in 0..MAX_TURNS {
            if sent < payload.len() {
                match client.write(&payload[sent..]) {
                    Ok(n) => sent += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => panic!("client write failed: {e}"),
                }
            }

            event_loop.turn(Some(TURN)).unwrap();

            loop {
                match client.read(&mut buf) {
                    Ok(0) => panic!("server closed the connection"),
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("client read failed: {e}"),
                }
            }

            if received.len() >= payload.len() {
                return received;
            }
        }
        panic!("echo incomplete: {} of {} bytes", received.len(), payload.len());
    }

    #[test]
    fn test_hello_round_trip() {
        let (mut event_loop, addr) = server();
        let mut client = connect(&mut event_loop, addr);

        assert_eq!(exchange(&mut event_loop, &mut client, b"hello"), b"hello");
    }

    #[test]
    fn test_eof_releases_connection() {
        let (mut event_loop, addr) = server();
        let mut client = connect(&mut event_loop, addr);
        assert_eq!(event_loop.len(), 2);

        client.shutdown(std::net::Shutdown::Write).unwrap();
        turn_until(&mut event_loop, |el| el.len() == 1);

        // Server side is closed: the client sees EOF.
        client.set_nonblocking(false).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_payload_larger_than_buffer() {
        let (mut event_loop, addr) = server();
        let mut client = connect(&mut event_loop, addr);

        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(exchange(&mut event_loop, &mut client, &payload), payload);
        assert_eq!(event_loop.len(), 2);
    }

    #[test]
    fn test_pending_backlog_accepted_one_per_event() {
        let (mut event_loop, addr) = server();

        // Queue several clients before the loop runs at all.
        let mut clients: Vec<TcpStream> = (0..4)
            .map(|_| {
                let client = TcpStream::connect(addr).unwrap();
                client.set_nonblocking(true).unwrap();
                client
            })
            .collect();

        turn_until(&mut event_loop, |el| el.len() == 5);

        for (i, client) in clients.iter_mut().enumerate() {
            let msg = format!("client-{i}");
            assert_eq!(
                exchange(&mut event_loop, client, msg.as_bytes()),
                msg.as_bytes()
            );
        }
    }

    #[test]
    fn test_reset_does_not_affect_other_connections() {
        let (mut event_loop, addr) = server();
        let mut a = connect(&mut event_loop, addr);
        let b = connect(&mut event_loop, addr);
        let mut c = connect(&mut event_loop, addr);
        assert_eq!(event_loop.len(), 4);

        // Abortive close on b: the server sees a reset or EOF.
        socket2::SockRef::from(&b)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(b);
        turn_until(&mut event_loop, |el| el.len() == 3);

        assert_eq!(exchange(&mut event_loop, &mut a, b"alpha"), b"alpha");
        assert_eq!(exchange(&mut event_loop, &mut c, b"gamma"), b"gamma");

        // And the listener keeps accepting.
        let mut d = connect(&mut event_loop, addr);
        assert_eq!(exchange(&mut event_loop, &mut d, b"delta"), b"delta");
        assert_eq!(event_loop.len(), 4);
    }

    #[test]
    fn test_repeated_cycles_do_not_leak() {
        let (mut event_loop, addr) = server();
        let baseline = event_loop.len();
        assert_eq!(baseline, 1);

        for _ in 0..1000 {
            let mut client = connect(&mut event_loop, addr);
            assert_eq!(exchange(&mut event_loop, &mut client, b"hello"), b"hello");
            client.shutdown(std::net::Shutdown::Write).unwrap();
            drop(client);
            turn_until(&mut event_loop, |el| el.len() == baseline);
        }
    }

    #[test]
    fn test_accept_error_keeps_listener() {
        let mut event_loop = EventLoop::new(16, 64).unwrap();

        // Bound but never listening: accept fails with EINVAL.
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        socket
            .bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).into())
            .unwrap();
        socket.set_nonblocking(true).unwrap();
        let mut state = ListenerState {
            listener: socket.into(),
        };

        let verdict = on_accept(&mut event_loop, &mut state).unwrap();
        assert_eq!(verdict, Verdict::Keep);
        assert_eq!(event_loop.len(), 0);
    }

    #[test]
    fn test_descriptor_exhaustion_classification() {
        for errno in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            assert!(is_descriptor_exhaustion(&io::Error::from_raw_os_error(errno)));
        }
        assert!(!is_descriptor_exhaustion(&io::Error::from_raw_os_error(
            libc::ECONNABORTED
        )));
        assert!(!is_descriptor_exhaustion(&io::Error::from(
            io::ErrorKind::WouldBlock
        )));
    }

    #[test]
    fn test_bind_conflict_is_startup_error() {
        let (mut event_loop, addr) = server();
        let SocketAddr::V4(addr) = addr else {
            panic!("expected an IPv4 listener");
        };

        // SO_REUSEADDR does not allow two listeners on one port.
        let result = start_listening(&mut event_loop, addr, 5);
        assert!(matches!(result, Err(StartupError::Bind { .. })));
        assert_eq!(event_loop.len(), 1);
    }
}
