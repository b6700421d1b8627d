use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("failed to get lock")]
    FailedToGetLock,

    #[error("load balancer not found: {0}")]
    LoadBalancerNotFound(String),

    #[error("listener not found: {0}")]
    ListenerNotFound(String),

    #[error("listener {0} is owned by another load balancer")]
    ListenerConflict(String),

    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("invalid listener: {0}")]
    InvalidListener(String),

    #[error("provider is not supported: {0}")]
    UnsupportedProvider(String),

    #[error("provider error: {0}")]
    Provider(String),
}

impl Error {
    // The external object is gone, so cached knowledge about it is stale.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::LoadBalancerNotFound(_) | Error::ListenerNotFound(_)
        )
    }
}
