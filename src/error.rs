use thiserror::Error;

/// Failures raised by the network backend adapter and the system-command
/// plumbing. Raw process errors never cross this boundary unwrapped; the
/// diagnostic text from the external tool is carried along for logging.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("network backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend command failed: {0}")]
    CommandFailed(String),

    #[error("failed to parse backend output: {0}")]
    Parse(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}
