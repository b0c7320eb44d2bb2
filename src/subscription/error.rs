use thiserror::Error;

pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Maximum of {0} shell subscriptions reached")]
    TooManySubscriptions(usize),

    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("Unknown subscription {0}")]
    UnknownSubscription(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Failed to encode shell data: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Callback failed: {0}")]
    Callback(String),
}

impl SubscriptionError {
    pub fn invalid<E: std::fmt::Display>(msg: E) -> Self {
        Self::InvalidSubscription(msg.to_string())
    }

    pub fn callback<E: std::fmt::Display>(msg: E) -> Self {
        Self::Callback(msg.to_string())
    }
}
