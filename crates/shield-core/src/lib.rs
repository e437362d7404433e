#![forbid(unsafe_code)]

//! Result model and capability contract shared by the pipeline, router and audit trail.

pub mod contract;
pub mod ids;
pub mod message;
pub mod provenance;
pub mod result;
pub mod types;

pub use contract::*;
pub use ids::*;
pub use message::*;
pub use provenance::*;
pub use result::*;
pub use types::*;
