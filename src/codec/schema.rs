//! Contains [`ErasableSchema`], the field-tree descriptor that drives the
//! split of a payload into its immutable and erasable halves.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// How a single named field participates in the erasable split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// The field lives in the erasable half only.
    Erasable,

    /// A nested object contributing to both halves according to its own
    /// schema.
    Partial(ErasableSchema),
}

/// Describes which leaves of a payload are privacy-regulated (erasable).
///
/// Fields not listed are non-erasable and stay in the immutable half. The
/// empty schema therefore declares a fully immutable payload.
///
/// ```
/// use consistently::codec::ErasableSchema;
///
/// let address = ErasableSchema::new().erasable("street").erasable("city");
/// let schema = ErasableSchema::new()
///     .erasable("name")
///     .erasable("email")
///     .partial("address", address);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErasableSchema {
    fields: BTreeMap<String, FieldKind>,
}

impl ErasableSchema {
    /// The empty schema: every field is immutable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a field as fully erasable.
    #[must_use]
    pub fn erasable(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), FieldKind::Erasable);
        self
    }

    /// Marks a field as a partly-erasable container with its own schema.
    #[must_use]
    pub fn partial(mut self, field: impl Into<String>, nested: ErasableSchema) -> Self {
        self.fields.insert(field.into(), FieldKind::Partial(nested));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Splits a serialized payload into its immutable and erasable trees.
    ///
    /// Non-object payloads have nothing to split and land fully on the
    /// immutable side. An erasable tree that would be empty is reported as
    /// absence.
    pub fn split(&self, value: Value) -> (Value, Option<Value>) {
        let Value::Object(entries) = value else {
            return (value, None);
        };

        let mut immutable = Map::new();
        let mut erasable = Map::new();

        for (field, value) in entries {
            match self.fields.get(&field) {
                None => {
                    immutable.insert(field, value);
                }
                Some(FieldKind::Erasable) => {
                    erasable.insert(field, value);
                }
                Some(FieldKind::Partial(nested)) => {
                    let (nested_immutable, nested_erasable) = nested.split(value);

                    // The container itself stays on the immutable side so a
                    // reconstruction without erasable data still shows it,
                    // with its non-erasable fields intact.
                    immutable.insert(field.clone(), nested_immutable);

                    if let Some(nested_erasable) = nested_erasable {
                        erasable.insert(field, nested_erasable);
                    }
                }
            }
        }

        let erasable = if erasable.is_empty() {
            None
        } else {
            Some(Value::Object(erasable))
        };

        (Value::Object(immutable), erasable)
    }
}

/// Structural deep merge of the two serialized trees: erasable keys
/// overwrite or add to immutable keys at the same path.
pub fn merge(immutable: Value, erasable: Value) -> Value {
    match (immutable, erasable) {
        (Value::Object(mut immutable), Value::Object(erasable)) => {
            for (field, value) in erasable {
                match immutable.remove(&field) {
                    Some(existing @ Value::Object(_)) if value.is_object() => {
                        immutable.insert(field, merge(existing, value));
                    }
                    _ => {
                        immutable.insert(field, value);
                    }
                }
            }
            Value::Object(immutable)
        }
        (_, erasable) => erasable,
    }
}
