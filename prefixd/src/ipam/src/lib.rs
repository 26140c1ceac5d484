pub mod error;
pub mod family;
pub mod range;
pub mod request;
pub mod set;

pub use family::IpFamily;
pub use range::IpRange;
pub use request::{AllocationRequest, AllocationResult, Incompatibility};
pub use set::AddressSet;
