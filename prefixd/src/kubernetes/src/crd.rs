pub mod common;
pub mod error;
pub mod ip;
pub mod prefix;
pub mod prefix_allocation;
