use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Signal delivery failed: {0}")]
    SignalError(#[from] nix::errno::Errno),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Usage: {0}")]
    UsageError(String),

    #[error("Command blocked: {0}")]
    CommandBlocked(String),

    #[error("Failed to start '{command}': {reason}")]
    SpawnError { command: String, reason: String },

    #[error("Cannot open '{path}': {reason}")]
    RedirectionError { path: String, reason: String },

    #[error("Command timed out after {0} ms")]
    TimeoutError(u128),

    #[error("Job {id} not found (valid ids: {valid})")]
    JobNotFound { id: u64, valid: String },

    #[error("No current job")]
    NoJobs,

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl AppError {
    pub fn usage(msg: impl Into<String>) -> Self {
        AppError::UsageError(msg.into())
    }

    pub fn spawn(command: &str, err: &std::io::Error) -> Self {
        AppError::SpawnError {
            command: command.to_string(),
            reason: err.to_string(),
        }
    }
}
