//! Structural contracts for values passed between stages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::ValidationError;

/// Object contract: the keys a value is guaranteed (or allowed) to carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectShape {
    /// Keys that are always present.
    #[serde(default)]
    pub required: BTreeSet<String>,
    /// Keys that may be present.
    #[serde(default)]
    pub optional: BTreeSet<String>,
}

/// The structural contract of a stage input or output.
///
/// Shapes are deliberately coarse: they describe the top-level kind of a
/// value and, for objects, which keys exist. That is enough to turn the
/// classic "downstream reads a key upstream never wrote" bug into a
/// composition error.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    /// Anything; no guarantee and no requirement.
    #[default]
    Any,
    /// JSON null.
    Null,
    /// A boolean.
    Bool,
    /// A number.
    Number,
    /// A string.
    String,
    /// An array whose elements all have the given shape.
    Array {
        /// Element shape.
        items: Box<Shape>,
    },
    /// An object.
    Object(ObjectShape),
    /// Any one of the given shapes.
    OneOf {
        /// The alternatives.
        variants: Vec<Shape>,
    },
}

impl Shape {
    /// An object that must carry every listed key.
    #[must_use]
    pub fn object<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Object(ObjectShape {
            required: required.into_iter().map(Into::into).collect(),
            optional: BTreeSet::new(),
        })
    }

    /// An object whose listed keys may each be absent.
    #[must_use]
    pub fn partial_object<I, S>(optional: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Object(ObjectShape {
            required: BTreeSet::new(),
            optional: optional.into_iter().map(Into::into).collect(),
        })
    }

    /// An array of `items`.
    #[must_use]
    pub fn array_of(items: Self) -> Self {
        Self::Array {
            items: Box::new(items),
        }
    }

    /// One of several shapes.
    #[must_use]
    pub fn one_of(variants: Vec<Self>) -> Self {
        Self::OneOf { variants }
    }

    /// Returns true for [`Shape::Any`].
    #[must_use]
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Checks, at composition time, that every value described by
    /// `produced` satisfies this (consumer) shape.
    ///
    /// A producer that declared nothing (`Any`) is accepted: the check can
    /// only reject what is known to be wrong.
    pub fn accepts(&self, produced: &Self) -> Result<(), ValidationError> {
        match (self, produced) {
            (Self::Any, _) | (_, Self::Any) => Ok(()),
            (_, Self::OneOf { variants }) => {
                for variant in variants {
                    self.accepts(variant)?;
                }
                Ok(())
            }
            (Self::OneOf { variants }, _) => {
                if variants.iter().any(|v| v.accepts(produced).is_ok()) {
                    Ok(())
                } else {
                    Err(ValidationError::new(format!(
                        "expected {self}, got {produced}"
                    )))
                }
            }
            (Self::Array { items: wanted }, Self::Array { items: given }) => wanted
                .accepts(given)
                .map_err(|e| ValidationError::new(format!("array element: {}", e.message))),
            (Self::Object(wanted), Self::Object(given)) => {
                for key in &wanted.required {
                    if given.required.contains(key) {
                        continue;
                    }
                    if given.optional.contains(key) {
                        return Err(ValidationError::for_field(
                            key.clone(),
                            "required downstream but may be missing upstream",
                        ));
                    }
                    return Err(ValidationError::for_field(
                        key.clone(),
                        format!("required downstream but not produced upstream (upstream produces {produced})"),
                    ));
                }
                Ok(())
            }
            (wanted, given) if wanted == given => Ok(()),
            (wanted, given) => Err(ValidationError::new(format!(
                "expected {wanted}, got {given}"
            ))),
        }
    }

    /// Checks a concrete value against this shape.
    pub fn check_value(&self, value: &serde_json::Value) -> Result<(), ValidationError> {
        use serde_json::Value;

        match (self, value) {
            (Self::Any, _)
            | (Self::Null, Value::Null)
            | (Self::Bool, Value::Bool(_))
            | (Self::Number, Value::Number(_))
            | (Self::String, Value::String(_)) => Ok(()),
            (Self::Array { items }, Value::Array(values)) => {
                for (index, item) in values.iter().enumerate() {
                    items.check_value(item).map_err(|e| {
                        ValidationError::for_field(format!("[{index}]"), e.to_string())
                    })?;
                }
                Ok(())
            }
            (Self::Object(shape), Value::Object(map)) => {
                match shape.required.iter().find(|key| !map.contains_key(*key)) {
                    Some(missing) => Err(ValidationError::for_field(
                        missing.clone(),
                        "missing required key",
                    )),
                    None => Ok(()),
                }
            }
            (Self::OneOf { variants }, _) => {
                if variants.iter().any(|v| v.check_value(value).is_ok()) {
                    Ok(())
                } else {
                    Err(ValidationError::new(format!(
                        "expected {self}, got {}",
                        describe_value(value)
                    )))
                }
            }
            (wanted, _) => Err(ValidationError::new(format!(
                "expected {wanted}, got {}",
                describe_value(value)
            ))),
        }
    }

    /// Combines the input contracts of stages that all receive the same
    /// value (parallel branches, branch cases).
    ///
    /// `Any` contributes nothing and object requirements are unioned. A
    /// one-of meeting an object contract narrows to its object alternative.
    /// Anything else must agree exactly.
    pub fn combine_inputs<'a, I>(shapes: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = &'a Self>,
    {
        let mut combined = Self::Any;
        for shape in shapes {
            combined = match (combined, shape) {
                (current, Self::Any) => current,
                (Self::Any, next) => next.clone(),
                (Self::Object(current), Self::Object(next)) => union_objects(current, next),
                (current, next) if &current == next => current,
                (Self::OneOf { variants }, next) if variants.contains(next) => next.clone(),
                (current, Self::OneOf { variants }) if variants.contains(&current) => current,
                (Self::OneOf { variants }, Self::OneOf { variants: others })
                    if object_variant(&variants).is_some() && object_variant(others).is_some() =>
                {
                    merge_one_ofs(&variants, others)
                }
                // An object consumer narrows a one-of to its object alternative.
                (Self::OneOf { variants }, Self::Object(next)) if object_variant(&variants).is_some() => {
                    union_objects(object_variant(&variants).cloned().unwrap_or_default(), next)
                }
                (Self::Object(current), Self::OneOf { variants }) if object_variant(variants).is_some() => {
                    union_objects(current, &object_variant(variants).cloned().unwrap_or_default())
                }
                (current, next) => {
                    return Err(ValidationError::new(format!(
                        "stages sharing one input disagree: {current} vs {next}"
                    )))
                }
            };
        }
        Ok(combined)
    }

    /// Returns the shape describing a concrete value (one level deep).
    #[must_use]
    pub fn of_value(value: &serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::array_of(Self::Any),
            Value::Object(map) => Self::object(map.keys().cloned()),
        }
    }
}

fn object_variant(variants: &[Shape]) -> Option<&ObjectShape> {
    variants.iter().find_map(|v| match v {
        Shape::Object(known) => Some(known),
        _ => None,
    })
}

fn union_objects(mut current: ObjectShape, next: &ObjectShape) -> Shape {
    current.required.extend(next.required.iter().cloned());
    current.optional.extend(next.optional.iter().cloned());
    let ObjectShape { required, optional } = current;
    let optional = optional.into_iter().filter(|k| !required.contains(k)).collect();
    Shape::Object(ObjectShape { required, optional })
}

/// Keeps the scalar alternatives both sides allow next to the unioned object.
fn merge_one_ofs(left: &[Shape], right: &[Shape]) -> Shape {
    let object = union_objects(
        object_variant(left).cloned().unwrap_or_default(),
        &object_variant(right).cloned().unwrap_or_default(),
    );
    let mut variants: Vec<Shape> = left
        .iter()
        .filter(|v| !matches!(v, Shape::Object(_)) && right.contains(v))
        .cloned()
        .collect();
    if variants.is_empty() {
        return object;
    }
    variants.push(object);
    Shape::one_of(variants)
}

fn describe_value(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;

    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Null => write!(f, "null"),
            Self::Bool => write!(f, "bool"),
            Self::Number => write!(f, "number"),
            Self::String => write!(f, "string"),
            Self::Array { items } => write!(f, "array<{items}>"),
            Self::Object(shape) => {
                let mut keys: Vec<String> = shape.required.iter().cloned().collect();
                keys.extend(shape.optional.iter().map(|k| format!("{k}?")));
                write!(f, "object{{{}}}", keys.join(", "))
            }
            Self::OneOf { variants } => {
                let parts: Vec<String> = variants.iter().map(ToString::to_string).collect();
                write!(f, "{}", parts.join(" | "))
            }
        }
    }
}
