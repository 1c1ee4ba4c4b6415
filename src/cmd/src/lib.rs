pub mod agent;
pub mod cmd;
