use crate::topic::TopicError;
use crate::types::{ConsumerId, MessageId};

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("invalid destination, {0}")]
    InvalidDestination(String),
    #[error("invalid selector, {0}")]
    InvalidSelector(String),
    #[error("invalid topic, {0}")]
    InvalidTopic(String),
    #[error("destination already exists, {0}")]
    DestinationExists(String),
    #[error("destination in use, {0}")]
    DestinationInUse(String),
    #[error("consumer closed, {0}")]
    ConsumerClosed(ConsumerId),
    #[error("consumer not found, {0}")]
    ConsumerNotFound(String),
    #[error("durable subscription is active, {0}")]
    DurableSubscriptionActive(String),
    #[error("durable subscription not found, {0}")]
    DurableSubscriptionNotFound(String),
    #[error("invalid state, {0}")]
    InvalidState(String),
    #[error("message destroyed, {0}")]
    MessageDestroyed(MessageId),
    #[error("destination cache closed, {0}")]
    CacheClosed(String),
    #[error("persistence error, {0}")]
    Persistence(String),
    #[error("{0}")]
    Anyhow(anyhow::Error),
    #[error("{0}")]
    Json(serde_json::Error),
    #[error("{0}")]
    Msg(String),
}

impl BrokerError {
    /// Usage errors are reported to the caller as-is and never retried.
    #[inline]
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            BrokerError::InvalidDestination(_)
                | BrokerError::InvalidSelector(_)
                | BrokerError::InvalidTopic(_)
                | BrokerError::DestinationExists(_)
                | BrokerError::DestinationInUse(_)
                | BrokerError::ConsumerClosed(_)
                | BrokerError::ConsumerNotFound(_)
                | BrokerError::DurableSubscriptionActive(_)
                | BrokerError::DurableSubscriptionNotFound(_)
                | BrokerError::InvalidState(_)
                | BrokerError::MessageDestroyed(_)
        )
    }

    /// The cache was collected between lookup and delivery; look it up again.
    #[inline]
    pub fn is_cache_closed(&self) -> bool {
        matches!(self, BrokerError::CacheClosed(_))
    }

    #[inline]
    pub fn is_persistence(&self) -> bool {
        matches!(self, BrokerError::Persistence(_) | BrokerError::Json(_))
    }
}

impl From<String> for BrokerError {
    #[inline]
    fn from(e: String) -> Self {
        BrokerError::Msg(e)
    }
}

impl From<&str> for BrokerError {
    #[inline]
    fn from(e: &str) -> Self {
        BrokerError::Msg(e.to_string())
    }
}

impl From<anyhow::Error> for BrokerError {
    #[inline]
    fn from(e: anyhow::Error) -> Self {
        BrokerError::Anyhow(e)
    }
}

impl From<serde_json::Error> for BrokerError {
    #[inline]
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Json(e)
    }
}

impl From<TopicError> for BrokerError {
    #[inline]
    fn from(e: TopicError) -> Self {
        BrokerError::InvalidTopic(e.to_string())
    }
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_taxonomy() {
        assert!(BrokerError::InvalidSelector("x >".into()).is_usage());
        assert!(BrokerError::DurableSubscriptionActive("sub".into()).is_usage());
        assert!(!BrokerError::Persistence("disk full".into()).is_usage());
        assert!(BrokerError::Persistence("disk full".into()).is_persistence());
        assert!(!BrokerError::from("oops").is_usage());
        assert!(BrokerError::CacheClosed("queue://q".into()).is_cache_closed());
        assert!(!BrokerError::CacheClosed("queue://q".into()).is_usage());

        let e: BrokerError = TopicError::InvalidTopic("a.**.b".into()).into();
        assert!(matches!(e, BrokerError::InvalidTopic(_)));
    }
}
