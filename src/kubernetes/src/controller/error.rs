use kube::core::admission::SerializePatchError;
use portd_trace::error::TraceableError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("std::io::Error")]
    StdIo(#[from] std::io::Error),

    #[error("failed to get lock")]
    FailedToGetLock,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("SerializationError: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("SerializePatchError: {0}")]
    SerializePatch(#[source] SerializePatchError),

    #[error("Kube Error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // finalizer::Error embeds this error, so it has to be boxed
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Kube Library Error: {0}")]
    KubeLibrary(#[source] crate::error::Error),

    #[error("Allocator Error: {0}")]
    Allocator(#[source] portd_allocator::error::Error),

    #[error("Cloud Error: {0}")]
    Cloud(#[source] portd_cloud::error::Error),

    #[error("Cloud call timed out: {0}")]
    CloudTimeout(String),

    #[error("PortPool not found: {0}")]
    PoolNotFound(String),

    #[error("Pool item not found: {0}")]
    PoolItemNotFound(String),

    #[error("Invalid port request: {0}")]
    InvalidPortRequest(String),

    #[error("Port cache is not ready")]
    CacheNotReady,

    #[error("Consumer address is not assigned yet")]
    ConsumerAddressNotAssigned,

    #[error("PortBinding is not cleaned yet: {0}")]
    BindingNotCleaned(String),

    #[error("Pool items are still referenced: {0}")]
    PoolItemsRemain(String),

    #[error("Missing object field: {0}")]
    MissingField(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load")]
    FailedToLoad,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    // Optimistic concurrency failure on the object store.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            Error::Cloud(e) => e.is_not_found(),
            _ => false,
        }
    }
}

impl TraceableError for &Error {
    fn metric_label(&self) -> String {
        (*self).metric_label()
    }
}

impl TraceableError for Error {
    fn metric_label(&self) -> String {
        let label = format!("{self:?}").to_lowercase();
        match label.find(|c: char| c == '(' || c == '{') {
            Some(pos) => label[..pos].trim().to_string(),
            None => label,
        }
    }
}
