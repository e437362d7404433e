//! Router: maps a completed validation result to exactly one routing decision.

pub mod predicate;
pub mod router;

pub use predicate::*;
pub use router::*;
