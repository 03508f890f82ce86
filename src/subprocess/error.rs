use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("process timed out after {0:?}")]
    Timeout(Duration),

    #[error("bad command line: {0}")]
    Tokenize(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
