use thiserror::Error;

/// Failures of the real-time price stream.
///
/// `Disconnected` and `Malformed` are recoverable: the feed reconnects or
/// skips the frame. `Unavailable` is fatal and only occurs when a bounded
/// retry policy has been exhausted.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("stream disconnected: {0}")]
    Disconnected(String),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("stream unavailable after {attempts} reconnect attempts")]
    Unavailable { attempts: u32 },
}

/// Failures reported by the order gateway.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Broker-side rejection (insufficient cash, bad order, closed market).
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Transport failure; the order may or may not have reached the broker.
    #[error("network error: {0}")]
    Network(String),
}
