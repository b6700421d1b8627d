use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Get Namespace Error")]
    GetNamespace,

    #[error("Invalid label {0}: {1}")]
    InvalidLabel(String, String),

    #[error("Missing label: {0}")]
    MissingLabel(String),

    #[error("Invalid annotation {0}: {1}")]
    InvalidAnnotation(String, String),
}
