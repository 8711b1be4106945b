use thiserror::Error;

/// Error returned by a [`DiscoverySubscriber`](crate::DiscoverySubscriber).
///
/// The bus logs and counts it; it never reaches the publisher.
#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("subscriber rejected discovery: {0}")]
    Rejected(String),

    #[error("subscriber unavailable: {0}")]
    Unavailable(String),
}
