pub mod artifacts;
pub mod launcher;
pub mod manager;
pub mod resolver;

#[cfg(test)]
pub(crate) mod testing;

pub use launcher::{CaptureLauncher, CapturePlan, NsenterTcpdump};
pub use manager::{SessionManager, DEFAULT_ROTATION_LIMIT};
pub use resolver::{PidResolver, ProcfsResolver};
