use thiserror::Error;

#[derive(Error, Debug)]
pub enum PartyError {
    #[error("failed to start agent process: {0}")]
    ProcessStart(String),

    #[error("failed to write to agent process: {0}")]
    ProcessWrite(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("collaborator rejected the credential: {0}")]
    CollaboratorAuth(String),

    #[error("collaborator request failed: {0}")]
    Collaborator(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PartyError {
    /// True when the failure means the stored credential is bad and
    /// should not be retried.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, PartyError::CollaboratorAuth(_))
    }
}
