//! Request dispatch.
//!
//! Turns a parsed command vector into a [`Command`] and executes it against the
//! store. Unrecognized input is an ordinary `ERROR` response, never a failure.

use crate::protocol::{Request, Response};
use crate::storage::Storage;

/// A recognized command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `get key`
    Get { key: Vec<u8> },
    /// `set key value`
    Set { key: Vec<u8>, value: Vec<u8> },
    /// `del key`
    Del { key: Vec<u8> },
}

impl Command {
    /// Match a command vector against the known verbs, checking arity exactly.
    pub fn from_request(request: Request) -> Option<Self> {
        let mut args = request.into_iter();
        let verb = args.next()?;

        match (verb.as_slice(), args.len()) {
            (b"get", 1) => Some(Command::Get { key: args.next()? }),
            (b"set", 2) => Some(Command::Set {
                key: args.next()?,
                value: args.next()?,
            }),
            (b"del", 1) => Some(Command::Del { key: args.next()? }),
            _ => None,
        }
    }
}

/// Execute one request against `storage`.
pub fn execute(request: Request, storage: &mut Storage) -> Response {
    let command = match Command::from_request(request) {
        Some(command) => command,
        None => return Response::error(),
    };

    match command {
        Command::Get { key } => match storage.get(&key) {
            Some(value) => Response::with_value(value.to_vec()),
            None => Response::not_found(),
        },
        Command::Set { key, value } => {
            storage.set(key, value);
            Response::ok()
        }
        Command::Del { key } => {
            storage.delete(&key);
            Response::ok()
        }
    }
}
