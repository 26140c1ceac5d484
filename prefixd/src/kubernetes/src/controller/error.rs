use kube::runtime::finalizer::Error as FinalizerError;
use prefixd_trace::error::TraceableError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("std::io::Error: {0}")]
    StdIo(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("SerializationError: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // boxed since finalizer::Error embeds this error
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Conflict: {0} was modified concurrently")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("CRD Error: {0}")]
    CRD(#[source] crate::crd::error::Error),

    #[error("Kube Library Error: {0}")]
    KubeLibrary(#[source] crate::error::Error),

    #[error("Ipam Error: {0}")]
    Ipam(#[source] prefixd_ipam::error::Error),

    #[error("Trace Error: {0}")]
    Trace(#[source] prefixd_trace::error::Error),

    #[error("Metrics Error: {0}")]
    Metrics(#[source] prometheus::Error),

    #[error("Prefix {0} is not allocated yet")]
    NotAllocated(String),

    #[error("Allocation {0} has no result")]
    MissingResult(String),

    #[error("Granted range {0} cannot be owned by a prefix")]
    UnexpectedRange(String),

    #[error("{0} is still referenced by {1} allocations")]
    HasDependents(String, usize),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    FailedToRead(String, #[source] std::io::Error),
    #[error("failed to load: {0}")]
    FailedToLoad(#[source] serde_yaml::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl TraceableError for &Error {
    fn metric_label(&self) -> String {
        (*self).metric_label()
    }
}

impl TraceableError for Error {
    fn metric_label(&self) -> String {
        match self {
            Error::StdIo(_) => "io",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
            Error::Kube(_) => "kube",
            Error::Finalizer(e) => match e.as_ref() {
                FinalizerError::ApplyFailed(inner) | FinalizerError::CleanupFailed(inner) => {
                    return inner.metric_label()
                }
                _ => "finalizer",
            },
            Error::Conflict(_) => "conflict",
            Error::NotFound(_) => "not_found",
            Error::CRD(_) => "crd",
            Error::KubeLibrary(_) => "kube_library",
            Error::Ipam(_) => "ipam",
            Error::Trace(_) => "trace",
            Error::Metrics(_) => "metrics",
            Error::NotAllocated(_) => "not_allocated",
            Error::MissingResult(_) => "missing_result",
            Error::UnexpectedRange(_) => "unexpected_range",
            Error::HasDependents(_, _) => "has_dependents",
        }
        .to_string()
    }
}
