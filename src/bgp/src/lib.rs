pub mod error;
pub mod family;
pub mod manager;
pub mod memory;
pub mod path;
pub mod peer;
pub mod policy;
pub mod speaker;
