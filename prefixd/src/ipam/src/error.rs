use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Protocol mismatch")]
    ProtocolMismatch,

    #[error("Invalid range: {0} is greater than {1}")]
    InvalidRange(IpAddr, IpAddr),

    #[error("Invalid range format: {0}")]
    InvalidRangeFormat(String),

    #[error("Invalid prefix length: {0}")]
    InvalidPrefixLength(u8),

    #[error("Invalid range length: {0}")]
    InvalidRangeLength(u128),
}
