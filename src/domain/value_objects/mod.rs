//! Value Objects
//!
//! Immutable domain objects defined by their attributes rather than identity.

mod bounding_box;
mod config_value;

pub use bounding_box::*;
pub use config_value::*;
