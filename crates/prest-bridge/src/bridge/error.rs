use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::connection::ConnectionState;
use super::diagnostics::Diagnostics;
use super::protocol::RemoteFailure;
use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("could not find the core, looked for: {}", display_paths(.candidates))]
    NotFound { candidates: Vec<PathBuf> },

    #[error("could not run core {}: {source}", .executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("core setup failed: {0}")]
    Setup(String),

    /// The core went away mid-call.
    #[error("core died: {}", .diagnostics.excerpt())]
    Died { diagnostics: Diagnostics },

    #[error("internal protocol error")]
    MalformedResponse {
        #[source]
        source: CodecError,
        diagnostics: Diagnostics,
    },

    #[error(transparent)]
    Failure(RemoteFailure),

    #[error("operation cancelled")]
    Cancelled,

    #[error("could not encode request: {0}")]
    Request(#[source] CodecError),

    #[error("connection is {0}, no further calls possible")]
    Unusable(ConnectionState),

    #[error("core call task failed: {0}")]
    TaskFailed(String),
}

impl CoreError {
    /// Stderr of the core, when the error came from a dead or misbehaving core.
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            Self::Died { diagnostics } | Self::MalformedResponse { diagnostics, .. } => {
                Some(diagnostics)
            }
            _ => None,
        }
    }

    /// Remote failures leave the connection usable; everything else that happens
    /// during a call does not.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Failure(_) | Self::Request(_))
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
