pub mod agent;
pub mod context;
pub mod crd;
pub mod error;
pub mod fixture;
pub mod mode;
pub mod reconciler;
pub mod selector;
pub mod signaler;
pub mod store;
pub mod tables;
pub mod util;
pub mod watcher;
