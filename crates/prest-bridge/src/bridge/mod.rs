//! Talking to the core process.
//!
//! - **protocol**: message types and the synchronous request/response loop
//! - **connection**: process lifecycle, async calls, cancellation, shutdown
//! - **diagnostics**: stderr collection and death-note excerpts
//! - **tee**: optional transcript of the raw streams

mod connection;
mod diagnostics;
mod error;
pub mod protocol;
mod tee;

pub use connection::{Connection, ConnectionState};
pub use diagnostics::{Diagnostics, StderrBuffer, salient_excerpt};
pub use error::CoreError;
pub use protocol::{CallObserver, LogLevel, LogRecord, Message, Protocol, RemoteFailure};
pub use tee::{TeeReader, TeeWriter};
