use std::fmt;
use std::fmt::Display;

/// Failure of one remote call to the session core
#[derive(Debug, Clone, PartialEq)]
pub enum RpcError {
    /// The core answered with an error message
    Remote(String),

    /// Connection to the core is gone; the call may or may not have run
    Disconnected,

    /// No response within the request timeout
    Timeout,

    /// Response payload did not have the expected shape
    Decode(String),
}

impl std::error::Error for RpcError {}

impl Display for RpcError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RpcError::Remote(msg) => write!(fmt, "core error: {}", msg),
            RpcError::Disconnected => "core connection closed".fmt(fmt),
            RpcError::Timeout => "core request timeout".fmt(fmt),
            RpcError::Decode(msg) => write!(fmt, "invalid core response: {}", msg),
        }
    }
}
