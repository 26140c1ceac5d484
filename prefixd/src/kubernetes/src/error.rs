use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Get Namespace Error")]
    GetNamespace,

    #[error("Get UID Error")]
    GetUid,

    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),
}
