//! tunegrid-remote — command transport for tuning hosts.
//!
//! A [`Connection`] runs one shell command line either as a local
//! subprocess or over an SSH session, behind the same interface:
//!
//! 1. Split the line on `;` and `|`, find each sub-command's binary, and
//!    confirm it with `which` (cached per connection).
//! 2. For remote hosts, (re)establish the session, retrying with a
//!    jittered sleep and polling the abort sentinels each attempt.
//! 3. Spawn the command with stderr merged into stdout and stream its
//!    output line by line, with an idle timeout between lines.

pub mod command;
pub mod connection;
pub mod error;

pub use command::{binary_of, split_subcommands};
pub use connection::{CommandOutput, Connection, RemoteEndpoint, RetryPolicy};
pub use error::{TransportError, TransportResult};
