//! Stage contracts.
//!
//! This module provides:
//! - Structural shapes checked when stages are composed
//! - Runtime validation of values against a shape
//! - Typed extraction of stage values

mod shape;
mod typed_output;

pub use shape::{ObjectShape, Shape};
pub use typed_output::{
    extract_field, parse_as, validate_fields, TypedOutput, ValidationError,
};
