#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuestError {
    /// Could not connect (VM not booted, agent not listening).
    #[error("guest unreachable: {0}")]
    Unreachable(String),
    /// The connection dropped with requests outstanding.
    #[error("guest channel disconnected")]
    Disconnected,
    #[error("guest {op} timed out after {timeout_ms}ms")]
    Timeout { op: String, timeout_ms: u64 },
    /// The agent rejected the request.
    #[error("guest error: {0}")]
    Remote(String),
    #[error("`{command}` exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("guest protocol error: {0}")]
    Protocol(String),
}

impl GuestError {
    /// The channel broke, as opposed to a command or request failing.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            GuestError::Unreachable(_) | GuestError::Disconnected | GuestError::Protocol(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GuestError::Timeout { .. })
    }
}
