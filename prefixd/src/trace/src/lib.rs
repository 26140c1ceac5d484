pub mod error;
pub mod init;
pub mod telemetry;
