//! framekv: a pipelined key-value server.
//!
//! Clients send length-prefixed frames carrying a command vector
//! (`get key`, `set key value`, `del key`); the server answers each frame
//! with a status code and an optional value, in request order.
//!
//! A single-threaded mio event loop multiplexes every connection, so the
//! store is owned by the loop and needs no locking.

pub mod client;
pub mod config;
pub mod protocol;
pub mod runtime;
pub mod storage;
