//! Core types, aggregate registry, and validation for the rollup engine.

pub mod error;
pub mod fold;
pub mod limits;
pub mod measure;
pub mod records;
pub mod registry;
pub mod retention;
pub mod schema;
pub mod sketch;

pub use error::{Error, Result};
pub use measure::*;
pub use records::*;
pub use registry::*;
pub use retention::*;
pub use sketch::HllSketch;
