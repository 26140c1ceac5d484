use thiserror::Error;

use super::common::IpFamily;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid CIDR: {0}")]
    InvalidCIDR(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Address family of {0} is not {1}")]
    FamilyMismatch(String, IpFamily),

    #[error("Prefix length /{0} is invalid for {1}")]
    InvalidPrefixLength(u8, IpFamily),

    #[error("Root prefix requires spec.prefix")]
    RootWithoutPrefix,

    #[error("Root prefix must not set spec.prefixLength")]
    RootWithPrefixLength,

    #[error("Either spec.prefix or spec.prefixLength is required")]
    MissingPrefix,

    #[error("Length of spec.prefix /{0} does not match spec.prefixLength /{1}")]
    PrefixLengthMismatch(u8, u8),

    #[error("Either spec.prefixRef or spec.prefixSelector is required")]
    MissingParent,

    #[error("spec.parentRef and spec.parentSelector can be set together only after assignment")]
    ParentRefAndSelector,

    #[error("Reservation length /{0} must be longer than the prefix length /{1}")]
    InvalidReservationLength(u8, u8),

    #[error("Request must set exactly one of prefix, prefixLength, range and rangeLength")]
    InvalidRequest,

    #[error("Result must set exactly one of prefix and range")]
    InvalidResult,
}
