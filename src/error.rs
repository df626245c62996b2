use std::{error::Error, fmt, io};

const ERR_MSG_INIT_TIMEOUT: &str = "engine did not confirm initialization in time";
const ERR_MSG_CLOSED: &str = "session is closing or closed";
const ERR_MSG_ENGINE_LOST: &str = "engine process lost";

/// Errors surfaced by the session control plane.
///
/// Everything the API collaborator can observe goes through this enum;
/// subscriber-side send failures are handled internally and never reach it.
#[derive(Debug)]
pub enum SessionError {
    /// Bad session id, unknown animator kind, or otherwise unusable input.
    InvalidInput(String),
    /// A session with this id already exists.
    AlreadyExists(String),
    /// No session with this id.
    NotFound(String),
    /// The engine did not complete the init handshake within the deadline.
    InitTimeout,
    /// The animator reported an initialization failure.
    InitFailure(String),
    /// Operation on a session past `Closing`.
    ClosedSession,
    /// The engine process exited or the command channel broke mid-stream.
    EngineLost,
    /// OS-level failure (shared memory, process spawn, pipes).
    Io(io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            SessionError::AlreadyExists(id) => write!(f, "session {id} already exists"),
            SessionError::NotFound(id) => write!(f, "session {id} not found"),
            SessionError::InitTimeout => write!(f, "{ERR_MSG_INIT_TIMEOUT}"),
            SessionError::InitFailure(reason) => write!(f, "animator init failed: {reason}"),
            SessionError::ClosedSession => write!(f, "{ERR_MSG_CLOSED}"),
            SessionError::EngineLost => write!(f, "{ERR_MSG_ENGINE_LOST}"),
            SessionError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SessionError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Io(e)
    }
}
