//! Status query errors

use std::fmt;
use std::fmt::Display;
use crate::proxy::status::Status;

/// Failure modes of a status query or of the cache lifecycle
#[derive(Debug)]
pub enum ProxyError {
    /// Every remote fetch the query needed failed
    Transport(crate::Error),

    /// Some chunk fetches failed
    ///
    /// Chunks that succeeded are already merged into the cache; `status` holds
    /// what could be assembled and `failed` the ids of the failing chunks.
    Partial {
        status: Status,
        failed: Vec<String>,
        source: crate::Error,
    },

    /// `start()` was called on a cache that is already running
    AlreadyRunning,
}

impl ProxyError {
    /// Whatever data the query managed to collect
    pub fn partial_status(&self) -> Option<&Status> {
        match self {
            ProxyError::Partial { status, .. } => Some(status),
            _ => None,
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Transport(e) => Some(e.as_ref()),
            ProxyError::Partial { source, .. } => Some(source.as_ref()),
            ProxyError::AlreadyRunning => None,
        }
    }
}

impl Display for ProxyError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProxyError::Transport(e) => write!(fmt, "status fetch failed: {}", e),
            ProxyError::Partial { failed, source, .. } => {
                write!(fmt, "status fetch failed for {} sessions: {}", failed.len(), source)
            }
            ProxyError::AlreadyRunning => "status cache already running".fmt(fmt),
        }
    }
}
