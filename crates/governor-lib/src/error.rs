//! Errors surfaced to callers of the governance layer

/// Error returned by caller-initiated operations
#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    /// No container engine could be detected
    #[error("no container runtime available")]
    RuntimeUnavailable,

    /// The referenced container does not exist
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// A runtime CLI invocation exited unsuccessfully
    #[error("command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Runtime output could not be interpreted
    #[error("failed to parse runtime output: {0}")]
    Parse(String),

    /// Any other collaborator failure
    #[error(transparent)]
    Gateway(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GovernorError>;

impl GovernorError {
    /// True when the error means the container is absent rather than broken
    pub fn is_not_found(&self) -> bool {
        matches!(self, GovernorError::ContainerNotFound(_))
    }
}
