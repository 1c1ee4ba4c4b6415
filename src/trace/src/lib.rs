pub mod error;
pub mod init;
pub mod metrics;
pub mod telemetry;
