// Position entry and exit execution.
pub mod engine;
pub mod entry;
pub mod pricing;

pub use engine::{ExitPolicy, ExitPolicyEngine, ExitState};
pub use entry::EntrySupervisor;
