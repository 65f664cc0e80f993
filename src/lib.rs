pub mod config;
pub mod engine;
pub mod limits;
pub mod loyalty;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod reconciler;
pub mod stash;
pub mod wire;
pub mod workflow;
