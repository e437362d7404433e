//! Append-only audit trail of validation outcomes, stored as JSON lines.

pub mod entry;
pub mod store;
pub mod trail;

pub use entry::*;
pub use store::*;
pub use trail::*;
