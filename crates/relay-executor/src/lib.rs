mod config;
mod executor;
mod queue;

pub use config::EngineConfig;
pub use executor::{is_retryable, RunExecutor, MERGE_NODE_ID};
pub use queue::RunQueue;
