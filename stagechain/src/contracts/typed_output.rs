//! Typed views over the `serde_json::Value`s that flow between stages.
//!
//! Stages exchange untyped values; these helpers move between those values
//! and concrete serde types at the edges of a pipeline.

use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;

/// Error during shape or typed output validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Error message.
    pub message: String,
    /// Field that caused the error, if applicable.
    pub field: Option<String>,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref field) = self.field {
            write!(f, "Field '{}': {}", field, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ValidationError {}

/// Converts between a serde type `T` and stage values.
#[derive(Debug)]
pub struct TypedOutput<T> {
    require_object: bool,
    _marker: PhantomData<T>,
}

impl<T> TypedOutput<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Creates a new typed output handler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            require_object: false,
            _marker: PhantomData,
        }
    }

    /// Only accept payloads that serialize to a JSON object.
    #[must_use]
    pub fn objects_only(mut self) -> Self {
        self.require_object = true;
        self
    }

    /// Serializes a payload into a stage value.
    pub fn to_value(&self, payload: &T) -> Result<serde_json::Value, ValidationError> {
        let value = serde_json::to_value(payload)
            .map_err(|e| ValidationError::new(format!("Serialization error: {e}")))?;

        if self.require_object && !value.is_object() {
            return Err(ValidationError::new("Payload must serialize to an object"));
        }
        Ok(value)
    }

    /// Deserializes a stage value, validating its structure.
    pub fn from_value(&self, value: serde_json::Value) -> Result<T, ValidationError> {
        if self.require_object && !value.is_object() {
            return Err(ValidationError::new("Expected a JSON object"));
        }
        serde_json::from_value(value)
            .map_err(|e| ValidationError::new(format!("Deserialization error: {e}")))
    }
}

impl<T> Default for TypedOutput<T>
where
    T: Serialize + DeserializeOwned,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Deserializes a borrowed stage value into `T`.
pub fn parse_as<T: DeserializeOwned>(value: &serde_json::Value) -> Result<T, ValidationError> {
    T::deserialize(value).map_err(|e| ValidationError::new(format!("Invalid type: {e}")))
}

/// Checks that an object value carries every listed field.
pub fn validate_fields(value: &serde_json::Value, required: &[&str]) -> Result<(), ValidationError> {
    let map = value
        .as_object()
        .ok_or_else(|| ValidationError::new("Value is not an object"))?;

    for field in required {
        if !map.contains_key(*field) {
            return Err(ValidationError::for_field(*field, "Required field is missing"));
        }
    }
    Ok(())
}

/// Extracts a typed field from an object value.
pub fn extract_field<T: DeserializeOwned>(
    value: &serde_json::Value,
    field: &str,
) -> Result<T, ValidationError> {
    let raw = value
        .get(field)
        .ok_or_else(|| ValidationError::for_field(field, "Field not found"))?;

    T::deserialize(raw).map_err(|e| ValidationError::for_field(field, format!("Invalid type: {e}")))
}
