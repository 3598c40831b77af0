use thiserror::Error;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("fleet channel closed, {topic} event not delivered")]
    ChannelClosed { topic: &'static str },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
