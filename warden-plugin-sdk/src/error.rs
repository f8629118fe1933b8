use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The host answered a call with an error.
    #[error("host error: {0}")]
    Host(String),

    #[error("channel to host closed")]
    ChannelClosed,
}
