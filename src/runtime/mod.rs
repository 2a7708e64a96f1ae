//! Runtime for serving the framed key-value protocol.
//!
//! - `buffer`: per-connection growable byte queue
//! - `connection`: connection state machine and registry
//! - `request`: command dispatch against the store
//! - `mio`: the readiness-driven event loop

pub mod buffer;
pub mod connection;
pub mod request;

mod mio;

pub use self::mio::{EventLoop, ShutdownHandle};

use crate::config::Config;
use crate::storage::Storage;

/// Bind the configured address and serve until the process exits.
pub fn run(config: Config) -> std::io::Result<()> {
    let mut event_loop = EventLoop::bind(&config, Storage::new())?;
    event_loop.run()
}
