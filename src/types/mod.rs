//! Core types shared across the engine: identifiers, the error taxonomy,
//! and the data model (§3 of `SPEC_FULL.md`).

pub mod domain;
pub mod error;
pub mod ids;

pub use domain::*;
pub use error::*;
pub use ids::*;
