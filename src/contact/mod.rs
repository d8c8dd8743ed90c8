//! Per-contact presence subscription state.

mod state;
mod table;

pub use state::{Contact, Subscription};
pub use table::ContactTable;
