//! Pipeline engine: runs an ordered list of checks against one input.

pub mod cancel;
pub mod config;
pub mod engine;

pub use cancel::*;
pub use config::*;
pub use engine::*;
