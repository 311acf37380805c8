pub mod committer;
pub mod context;
pub mod dream;
pub mod merger;
pub mod orchestrator;
pub mod publisher;
