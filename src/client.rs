//! Blocking client for the framed protocol.
//!
//! Used by the `framekv-cli` binary and by the server's end-to-end tests.

use crate::protocol::{self, FrameError, FrameLimits, Response};
use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

const READ_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Frame(#[from] FrameError),
    #[error("connection closed by server")]
    Closed,
}

/// A connection to a framekv server.
pub struct Client {
    stream: TcpStream,
    /// Bytes received but not yet decoded.
    buf: BytesMut,
    limits: FrameLimits,
}

impl Client {
    /// Connect to a server.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            limits: FrameLimits::default(),
        })
    }

    /// Bound how long `recv` may block.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Send one request without waiting for its response.
    pub fn send<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<(), ClientError> {
        let mut out = BytesMut::new();
        protocol::encode_request(args, &mut out);
        self.stream.write_all(&out)?;
        Ok(())
    }

    /// Send bytes as-is.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    /// Wait for the next response.
    pub fn recv(&mut self) -> Result<Response, ClientError> {
        loop {
            if let Some((response, used)) = protocol::parse_response(&self.buf, &self.limits)? {
                self.buf.advance(used);
                return Ok(response);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = match self.stream.read(&mut chunk) {
                Ok(0) => return Err(ClientError::Closed),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Send one request and wait for its response.
    pub fn call<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Response, ClientError> {
        self.send(args)?;
        self.recv()
    }

    /// Write every command in one batch, then read all responses in order.
    ///
    /// Nothing is read until the whole batch is written, so very large batches
    /// can stall once both directions' socket buffers fill up.
    pub fn pipeline<A: AsRef<[u8]>>(
        &mut self,
        commands: &[Vec<A>],
    ) -> Result<Vec<Response>, ClientError> {
        let mut out = BytesMut::new();
        for command in commands {
            protocol::encode_request(command, &mut out);
        }
        trace!(commands = commands.len(), bytes = out.len(), "Sending pipeline");
        self.stream.write_all(&out)?;

        commands.iter().map(|_| self.recv()).collect()
    }
}
