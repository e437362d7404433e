//! Concrete checks: JSON-Schema conformance, freshness, compliance rule packs, semantic scoring.

pub mod compliance;
pub mod freshness;
pub mod schema;
pub mod semantic;

pub use compliance::*;
pub use freshness::*;
pub use schema::*;
pub use semantic::*;
