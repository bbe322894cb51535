#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Subscriber(#[from] notify_subscriber::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WatchResult<T> = Result<T, WatchError>;
