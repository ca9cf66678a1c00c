use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// Session is no longer valid. Fatal to the chat screen.
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// Network or server failure. Recoverable.
    #[error("transport error: {0}")]
    Transport(String),
    /// Caller-side precondition violated before any request was made.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl ChatError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ChatError::Auth(_))
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
