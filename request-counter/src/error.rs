//! Error types for request-counter

use crate::persist_log::LoadError;
use displaydoc::Display;

/// Errors surfaced by the [`Counter`](crate::Counter)
#[derive(Debug, Display)]
pub enum Error {
    /// Invalid configuration: {0}
    Config(String),
    /// Startup load failed: {0}
    Load(LoadError),
    /// Could not open persistence log for appending: {0}
    OpenAppender(std::io::Error),
    /// Append to persistence log failed: {0}
    Append(std::io::Error),
    /// Counter background tasks were already started
    AlreadyStarted,
}

impl From<LoadError> for Error {
    fn from(src: LoadError) -> Self {
        Self::Load(src)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Load(err) => Some(err),
            Self::OpenAppender(err) | Self::Append(err) => Some(err),
            Self::Config(_) | Self::AlreadyStarted => None,
        }
    }
}
