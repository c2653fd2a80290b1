//! prest-bridge: binary codecs and the subprocess protocol behind Prest.
//!
//! The GUI side of Prest keeps its data in memory and hands the heavy
//! computation to a separate core process. This crate provides both halves of
//! that conversation plus the on-disk workspace format.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod progress;
mod version;
pub mod workspace;

pub use bridge::{Connection, ConnectionState, CoreError, RemoteFailure};
pub use codec::{Codec, CodecError, ProgressCodec};
pub use config::CoreConfig;
pub use progress::{CancellationToken, Cancelled, ProgressTracker, Step};
pub use version::{PREST_VERSION, VersionInfo, program_version};
pub use workspace::{Dataset, DatasetSummary, PersistenceError, Workspace};
