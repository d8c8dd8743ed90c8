mod directory;
mod loader;
mod types;

pub use types::*;
