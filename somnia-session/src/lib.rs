pub mod router;
pub mod subsystems;
pub mod supervisor;
pub mod workers;

#[cfg(test)]
pub(crate) mod testing;

pub use supervisor::{SessionContext, SessionOutput, SessionState, Supervisor};
pub use workers::{spawn_workers, Collaborators, WorkerEvent, WorkerName, WorkerTable};
