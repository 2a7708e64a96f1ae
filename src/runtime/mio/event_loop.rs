//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Iteration
//!
//! 1. Block in `poll` until something is ready (no timeout).
//! 2. Accept every pending connection on the listener.
//! 3. Drive each ready connection's read/write handlers and re-register its
//!    interest if its intents changed.
//! 4. Reap every connection that asked to close.
//!
//! Handles are released only in step 4, so an accept in step 2 can never be
//! handed the slot of a connection that still has events queued in this batch.

use crate::config::Config;
use crate::protocol::FrameLimits;
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::storage::Storage;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Bytes requested from the socket per read call.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Single-threaded reactor serving every connection and owning the store.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionRegistry<TcpStream>,
    storage: Storage,
    limits: FrameLimits,
    /// Read target shared by all connections.
    scratch: Vec<u8>,
    /// Handles to reap at the end of the current iteration.
    closing: Vec<usize>,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

/// Stops a running [`EventLoop`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the loop to close every connection and return from `run`.
    pub fn shutdown(&self) -> io::Result<()> {
        self.flag.store(true, Ordering::Release);
        self.waker.wake()
    }
}

impl EventLoop {
    /// Bind the listener and prepare the poller.
    pub fn bind(config: &Config, storage: Storage) -> io::Result<Self> {
        let poll = Poll::new()?;

        let listener = create_listener(config.listen)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        info!(
            addr = %listener.local_addr()?,
            max_connections = config.max_connections,
            max_message_size = config.limits.max_message_size,
            max_args = config.limits.max_args,
            "Listening"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            listener,
            connections: ConnectionRegistry::new(config.max_connections),
            storage,
            limits: config.limits,
            scratch: vec![0u8; READ_CHUNK_SIZE],
            closing: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Serve until shut down. Only poll failures are returned as errors.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.shutdown.load(Ordering::Acquire) {
            self.turn()?;
        }
        self.close_all();
        Ok(())
    }

    /// One reactor iteration.
    fn turn(&mut self) -> io::Result<()> {
        match self.poll.poll(&mut self.events, None) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let Self {
            poll,
            events,
            listener,
            connections,
            storage,
            limits,
            scratch,
            closing,
            ..
        } = self;
        let registry = poll.registry();

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => accept_connections(listener, registry, connections, *limits),
                WAKER_TOKEN => trace!("Woken"),
                Token(conn_id) => handle_connection_event(
                    conn_id,
                    event,
                    registry,
                    connections,
                    storage,
                    scratch,
                    closing,
                ),
            }
        }

        reap_closed(registry, connections, closing);
        Ok(())
    }

    fn close_all(&mut self) {
        let registry = self.poll.registry();
        let mut closed = 0;
        for mut conn in self.connections.drain() {
            let _ = registry.deregister(conn.stream_mut());
            closed += 1;
        }

        let stats = self.storage.stats();
        info!(
            closed_connections = closed,
            items = stats.item_count,
            memory_used = stats.memory_used,
            "Event loop stopped"
        );
    }
}

fn accept_connections(
    listener: &TcpListener,
    registry: &Registry,
    connections: &mut ConnectionRegistry<TcpStream>,
    limits: FrameLimits,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let conn_id =
                    match connections.insert_with(|id| Connection::new(id, stream, limits)) {
                        Some(id) => id,
                        None => {
                            warn!(
                                peer = %peer_addr,
                                max_connections = connections.capacity(),
                                "Connection limit reached"
                            );
                            continue;
                        }
                    };

                let Some(conn) = connections.get_mut(conn_id) else {
                    continue;
                };
                if let Err(e) = registry.register(conn.stream_mut(), Token(conn_id), Interest::READABLE)
                {
                    warn!(peer = %peer_addr, error = %e, "Failed to register connection");
                    connections.remove(conn_id);
                    continue;
                }

                debug!(conn_id, peer = %peer_addr, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Accept error");
                break;
            }
        }
    }
}

fn handle_connection_event(
    conn_id: usize,
    event: &Event,
    registry: &Registry,
    connections: &mut ConnectionRegistry<TcpStream>,
    storage: &mut Storage,
    scratch: &mut [u8],
    closing: &mut Vec<usize>,
) {
    let conn = match connections.get_mut(conn_id) {
        Some(conn) => conn,
        None => return,
    };
    // Already queued for reaping
    if conn.want_close() {
        return;
    }

    if event.is_error() || (event.is_write_closed() && conn.want_write()) {
        debug!(conn_id, "Socket error");
        conn.close();
    } else {
        if event.is_readable() && conn.want_read() {
            conn.on_readable(storage, scratch);
        }
        if event.is_writable() && conn.want_write() && !conn.want_close() {
            conn.on_writable();
        }
    }

    match conn.interest() {
        None => closing.push(conn_id),
        Some(interest) if interest != conn.registered() => {
            match registry.reregister(conn.stream_mut(), Token(conn_id), interest) {
                Ok(()) => conn.set_registered(interest),
                Err(e) => {
                    debug!(conn_id, error = %e, "Failed to update interest");
                    conn.close();
                    closing.push(conn_id);
                }
            }
        }
        Some(_) => {}
    }
}

fn reap_closed(
    registry: &Registry,
    connections: &mut ConnectionRegistry<TcpStream>,
    closing: &mut Vec<usize>,
) {
    for conn_id in closing.drain(..) {
        if let Some(mut conn) = connections.remove(conn_id) {
            let _ = registry.deregister(conn.stream_mut());
            debug!(conn_id, "Connection closed");
        }
    }
}

/// Create a non-blocking TCP listener with address reuse.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientError};
    use crate::protocol::{Response, Status};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    struct TestServer {
        addr: SocketAddr,
        handle: ShutdownHandle,
        thread: JoinHandle<EventLoop>,
    }

    impl TestServer {
        fn start(config: Config) -> Self {
            let config = Config {
                listen: "127.0.0.1:0".parse().unwrap(),
                ..config
            };
            let mut event_loop = EventLoop::bind(&config, Storage::new()).unwrap();
            let addr = event_loop.local_addr().unwrap();
            let handle = event_loop.shutdown_handle();
            let thread = thread::spawn(move || {
                event_loop.run().unwrap();
                event_loop
            });
            Self {
                addr,
                handle,
                thread,
            }
        }

        fn client(&self) -> Client {
            let client = Client::connect(self.addr).unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            client
        }

        fn stop(self) -> EventLoop {
            self.handle.shutdown().unwrap();
            self.thread.join().unwrap()
        }
    }

    #[test]
    fn test_pipelined_scenario() {
        let server = TestServer::start(Config::default());
        let mut client = server.client();

        let responses = client
            .pipeline(&[
                vec!["set", "k1", "v1"],
                vec!["get", "k1"],
                vec!["del", "k1"],
                vec!["get", "k1"],
            ])
            .unwrap();

        assert_eq!(
            responses,
            vec![
                Response::ok(),
                Response::with_value(b"v1".to_vec()),
                Response::ok(),
                Response::not_found(),
            ]
        );

        let event_loop = server.stop();
        assert!(event_loop.storage().is_empty());
        assert_eq!(event_loop.connection_count(), 0);
    }

    #[test]
    fn test_many_interleaved_clients() {
        let server = TestServer::start(Config::default());
        let mut clients: Vec<Client> = (0..20).map(|_| server.client()).collect();

        for (i, client) in clients.iter_mut().enumerate() {
            client
                .send(&[b"set".to_vec(), format!("key{i}").into_bytes(), vec![i as u8; i]])
                .unwrap();
        }
        for client in clients.iter_mut() {
            assert_eq!(client.recv().unwrap(), Response::ok());
        }
        for (i, client) in clients.iter_mut().enumerate().rev() {
            let response = client.call(&["get".to_string(), format!("key{i}")]).unwrap();
            assert_eq!(response, Response::with_value(vec![i as u8; i]));
        }

        let event_loop = server.stop();
        assert_eq!(event_loop.storage().len(), 20);
    }

    #[test]
    fn test_large_value() {
        let server = TestServer::start(Config::default());
        let mut client = server.client();

        let value: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let response = client
            .call(&[b"set".as_slice(), b"big".as_slice(), value.as_slice()])
            .unwrap();
        assert_eq!(response, Response::ok());

        let response = client.call(&["get", "big"]).unwrap();
        assert_eq!(response.status, Status::Ok);
        assert!(response.value == value);

        server.stop();
    }

    #[test]
    fn test_oversized_frame_closes_only_offender() {
        let config = Config {
            limits: FrameLimits {
                max_message_size: 1024,
                max_args: 16,
            },
            ..Config::default()
        };
        let server = TestServer::start(config);
        let mut good = server.client();
        let mut bad = server.client();

        assert_eq!(good.call(&["set", "k", "v"]).unwrap(), Response::ok());

        bad.send_raw(&2048u32.to_le_bytes()).unwrap();
        assert!(bad.recv().is_err());

        assert_eq!(
            good.call(&["get", "k"]).unwrap(),
            Response::with_value(b"v".to_vec())
        );

        server.stop();
    }

    #[test]
    fn test_malformed_frame_closes_connection() {
        let server = TestServer::start(Config::default());
        let mut client = server.client();

        // argc = 2 but only one argument present
        let mut payload = 2u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&3u32.to_le_bytes());
        payload.extend_from_slice(b"get");
        let mut frame = (payload.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&payload);

        client.send_raw(&frame).unwrap();
        assert!(client.recv().is_err());

        let mut other = server.client();
        assert_eq!(other.call(&["get", "x"]).unwrap(), Response::not_found());

        server.stop();
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let server = TestServer::start(Config::default());
        let mut client = server.client();

        let mut frame = bytes::BytesMut::new();
        crate::protocol::encode_request(&["set", "slow", "drip"], &mut frame);
        for byte in frame.iter() {
            client.send_raw(&[*byte]).unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(client.recv().unwrap(), Response::ok());
        assert_eq!(
            client.call(&["get", "slow"]).unwrap(),
            Response::with_value(b"drip".to_vec())
        );

        server.stop();
    }

    #[test]
    fn test_unknown_command_keeps_connection_open() {
        let server = TestServer::start(Config::default());
        let mut client = server.client();

        assert_eq!(client.call(&["GET", "k"]).unwrap(), Response::error());
        assert_eq!(client.call(&["get"]).unwrap(), Response::error());
        assert_eq!(client.call(&["get", "k"]).unwrap(), Response::not_found());

        server.stop();
    }

    #[test]
    fn test_connection_limit() {
        let config = Config {
            max_connections: 1,
            ..Config::default()
        };
        let server = TestServer::start(config);
        let mut first = server.client();
        assert_eq!(first.call(&["set", "a", "1"]).unwrap(), Response::ok());

        let mut second = server.client();
        let result = second.call(&["get", "a"]);
        assert!(result.is_err());

        assert_eq!(
            first.call(&["get", "a"]).unwrap(),
            Response::with_value(b"1".to_vec())
        );

        server.stop();
    }

    #[test]
    fn test_peer_disconnect_frees_slot() {
        let config = Config {
            max_connections: 1,
            ..Config::default()
        };
        let server = TestServer::start(config);

        {
            let mut client = server.client();
            assert_eq!(client.call(&["set", "a", "1"]).unwrap(), Response::ok());
        }

        // The slot is released once the server sees EOF; retry until it has.
        let mut attempts = 0;
        let response = loop {
            let mut client = server.client();
            match client.call(&["get", "a"]) {
                Ok(response) => break response,
                Err(_) if attempts < 50 => {
                    attempts += 1;
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => panic!("server never released the slot: {e}"),
            }
        };
        assert_eq!(response, Response::with_value(b"1".to_vec()));

        server.stop();
    }

    #[test]
    fn test_shutdown_closes_connections() {
        let server = TestServer::start(Config::default());
        let mut client = server.client();
        assert_eq!(client.call(&["set", "a", "1"]).unwrap(), Response::ok());

        let event_loop = server.stop();
        assert_eq!(event_loop.connection_count(), 0);
        assert_eq!(event_loop.storage().len(), 1);
        drop(event_loop);

        let _ = client.send(&["get", "a"]);
        assert!(matches!(
            client.recv(),
            Err(ClientError::Closed) | Err(ClientError::Io(_))
        ));
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config {
            listen: taken.local_addr().unwrap(),
            ..Config::default()
        };
        // Address reuse does not allow two listeners on the same port
        assert!(EventLoop::bind(&config, Storage::new()).is_err());
    }
}
