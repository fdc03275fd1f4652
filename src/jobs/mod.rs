pub mod board;
/// Job lifecycle transitions
///
/// Conditional (compare-and-swap) updates against the storage collaborator.
pub mod state_machine;
pub mod store;

pub use board::JobBoard;
pub use state_machine::JobStateMachine;
pub use store::{JobChange, JobStore, MemoryJobStore};
