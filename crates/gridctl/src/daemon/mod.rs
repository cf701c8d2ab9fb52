pub mod lifecycle;
pub mod lock;
pub mod process;
pub mod state;

pub use lifecycle::{LifecycleController, StatusEntry, DEFAULT_READY_TIMEOUT};
pub use lock::StateLock;
pub use process::ForkOutcome;
pub use state::DaemonState;
