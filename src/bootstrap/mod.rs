mod server;
mod shutdown;
mod supervisor;

pub use server::Server;
pub use shutdown::{ShutdownManager, ShutdownState, TaskGuard};
pub use supervisor::supervise;
