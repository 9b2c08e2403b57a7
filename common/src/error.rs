use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("cloud port must be between 1 and 65535")]
    Port,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallerError {
    #[error("no update in progress")]
    NotStarted,
    #[error("image of {0} bytes does not fit the update partition")]
    TooLarge(usize),
    #[error("failed to write {len} bytes at offset {offset}: {reason}")]
    Write {
        offset: usize,
        len: usize,
        reason: String,
    },
    #[error("failed to finalize image: {0}")]
    Finalize(String),
    #[error("update partition unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaFailure {
    #[error("firmware title mismatch (running `{running}`, offered `{offered}`)")]
    TitleMismatch { running: String, offered: String },
    #[error("installer could not start: {0}")]
    Begin(InstallerError),
    #[error("chunk {chunk} failed and the retry budget is exhausted")]
    RetriesExhausted { chunk: u32 },
    #[error("checksum mismatch (expected {expected}, got {actual})")]
    Checksum { expected: String, actual: String },
    #[error("installer could not finalize: {0}")]
    Finalize(InstallerError),
    #[error("firmware response topic could not be subscribed")]
    Subscribe,
}
