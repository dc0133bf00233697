// Supervisor error taxonomy
// Distinguishes the outcomes the router must treat differently: drop, ignore, retry or reboot

/// Why an inbound message or request was not acted upon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// Unparseable payload or missing / non-string / unknown field. Logged and dropped.
    MalformedMessage(String),
    /// Update or self-test message not addressed to this device. Silently ignored.
    NotTargeted,
    /// An update task is already running; the request is a no-op.
    AlreadyInProgress,
    /// Network send, reconnect or update-step failure that may be retried locally.
    Transient(String),
    /// Unrecoverable in place; the device reboots.
    Fatal(String),
}

impl SupervisorError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        SupervisorError::MalformedMessage(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SupervisorError::Fatal(_))
    }
}

impl core::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SupervisorError::MalformedMessage(msg) => write!(f, "Malformed message: {}", msg),
            SupervisorError::NotTargeted => write!(f, "Message not addressed to this device"),
            SupervisorError::AlreadyInProgress => write!(f, "Update already in progress"),
            SupervisorError::Transient(msg) => write!(f, "Transient failure: {}", msg),
            SupervisorError::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl std::error::Error for SupervisorError {}
