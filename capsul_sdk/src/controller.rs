//! Typed attribute container with change notification (spec.md §4.1).
//!
//! Every graph node (process, pipeline, switch, iteration) embeds a
//! [`Controller`] to own its [`Field`] descriptors and current attribute
//! values. Suppression of change notifications during bulk edits is an
//! explicit [`HoldChanges`] guard rather than a hidden flag, per the
//! Design Notes.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

/// Node attribute names that a [`Field`] may never reuse.
pub const RESERVED_FIELD_NAMES: [&str; 4] = ["enabled", "activated", "node_type", "name"];

/// How a path-typed field should be treated when resolving metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PathType {
    #[default]
    None,
    File,
    Directory,
}

/// The declared type of a field's value. Compatibility checks between
/// linked plugs use structural equality of this enum (spec.md §4.2 Link
/// discipline): exact equality, `Any` accepts everything, and `List(T)`
/// accepts either a single `T` or a list of `T` under the list-proxy rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Any,
    Bool,
    Int,
    Float,
    Str,
    List(Box<FieldType>),
    Dict,
}

impl FieldType {
    /// Structural compatibility as used by link validation.
    pub fn compatible_with(&self, other: &FieldType) -> bool {
        match (self, other) {
            (FieldType::Any, _) | (_, FieldType::Any) => true,
            (FieldType::List(a), FieldType::List(b)) => a.compatible_with(b),
            // A scalar source may feed a list-typed destination: the
            // declared list-proxy rule from spec.md §4.2.
            (a, FieldType::List(b)) => a.compatible_with(b),
            (FieldType::List(a), b) => a.compatible_with(b),
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Any => write!(f, "any"),
            FieldType::Bool => write!(f, "bool"),
            FieldType::Int => write!(f, "int"),
            FieldType::Float => write!(f, "float"),
            FieldType::Str => write!(f, "str"),
            FieldType::List(t) => write!(f, "list<{t}>"),
            FieldType::Dict => write!(f, "dict"),
        }
    }
}

/// A field's value, or the distinguished `undefined` sentinel, which is
/// distinct from both `Null` and any valid JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Undefined,
    Value(serde_json::Value),
}

impl FieldValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, FieldValue::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Value(serde_json::Value::Null))
    }

    /// True for "has a real, present value" — used by OptionalOutputSwitch
    /// to decide whether to route to `real` or `_none`.
    pub fn is_present(&self) -> bool {
        !self.is_undefined() && !self.is_null()
    }

    pub fn null() -> Self {
        FieldValue::Value(serde_json::Value::Null)
    }

    pub fn from_str(s: impl Into<String>) -> Self {
        FieldValue::Value(serde_json::Value::String(s.into()))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Value(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<serde_json::Value>> {
        match self {
            FieldValue::Value(serde_json::Value::Array(a)) => Some(a),
            _ => None,
        }
    }
}

impl Default for FieldValue {
    fn default() -> Self {
        FieldValue::Undefined
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::from_str(s)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Value(serde_json::Value::Bool(b))
    }
}

/// Per-field metadata, matching spec.md §4.1's "at minimum" list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub hidden: bool,
    pub dataset: Option<String>,
    pub allowed_extensions: Vec<String>,
    pub doc: Option<String>,
}

/// A typed, named attribute descriptor.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub default: FieldValue,
    pub is_output: bool,
    pub optional: bool,
    pub path_type: PathType,
    pub metadata: FieldMetadata,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Field {
            name: name.into(),
            field_type,
            default: FieldValue::Undefined,
            is_output: false,
            optional: false,
            path_type: PathType::None,
            metadata: FieldMetadata::default(),
        }
    }

    pub fn output(mut self, output: bool) -> Self {
        self.is_output = output;
        self
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn path_type(mut self, path_type: PathType) -> Self {
        self.path_type = path_type;
        self
    }

    pub fn default_value(mut self, value: FieldValue) -> Self {
        self.default = value;
        self
    }

    pub fn dataset(mut self, dataset: impl Into<String>) -> Self {
        self.metadata.dataset = Some(dataset.into());
        self
    }

    pub fn has_default_value(&self) -> bool {
        !self.default.is_undefined()
    }
}

type Observer = Box<dyn Fn(&str, &FieldValue, &FieldValue) + Send + Sync>;

/// Typed attribute container owned by every node.
#[derive(Default)]
pub struct Controller {
    fields: indexmap::IndexMap<String, Field>,
    values: HashMap<String, FieldValue>,
    observers: HashMap<String, Vec<Observer>>,
    hold_depth: u32,
    pending: HashMap<String, FieldValue>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("values", &self.values)
            .finish()
    }
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field(&mut self, field: Field) -> Result<(), DefinitionError> {
        if RESERVED_FIELD_NAMES.contains(&field.name.as_str()) {
            return Err(DefinitionError::ReservedFieldName(field.name));
        }
        if self.fields.contains_key(&field.name) {
            return Err(DefinitionError::FieldExists(field.name));
        }
        let default = field.default.clone();
        self.values.insert(field.name.clone(), default);
        self.fields.insert(field.name.clone(), field);
        Ok(())
    }

    pub fn remove_field(&mut self, name: &str) -> Result<(), DefinitionError> {
        if self.fields.shift_remove(name).is_none() {
            return Err(DefinitionError::UnknownField(name.to_string()));
        }
        self.values.remove(name);
        self.observers.remove(name);
        Ok(())
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }

    /// Fields meant for user interaction: not hidden.
    pub fn user_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values().filter(|f| !f.metadata.hidden)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn value(&self, name: &str) -> FieldValue {
        self.values.get(name).cloned().unwrap_or_default()
    }

    pub fn set_value(&mut self, name: &str, value: FieldValue) -> Result<(), DefinitionError> {
        if !self.fields.contains_key(name) {
            return Err(DefinitionError::UnknownField(name.to_string()));
        }
        let old = self.values.get(name).cloned().unwrap_or_default();
        if old == value {
            return Ok(());
        }
        self.values.insert(name.to_string(), value.clone());

        if self.hold_depth > 0 {
            self.pending.insert(name.to_string(), old);
            return Ok(());
        }

        self.fire(name, &old, &value);
        Ok(())
    }

    fn fire(&self, name: &str, old: &FieldValue, new: &FieldValue) {
        if let Some(observers) = self.observers.get(name) {
            for observer in observers {
                observer(name, old, new);
            }
        }
    }

    pub fn on_attribute_change(
        &mut self,
        name: &str,
        observer: impl Fn(&str, &FieldValue, &FieldValue) + Send + Sync + 'static,
    ) {
        self.observers
            .entry(name.to_string())
            .or_default()
            .push(Box::new(observer));
    }

    /// Suppress notifications fired by `set_value` until a matching
    /// [`Controller::end_hold`]. Nested holds stack via a depth counter;
    /// this is the explicit mode flag the Design Notes call for, in place
    /// of a hidden `__block_output_propagation`-style field.
    pub fn begin_hold(&mut self) {
        self.hold_depth += 1;
    }

    /// Release one level of hold. Once the outermost hold is released,
    /// every field touched during the hold fires exactly once, comparing
    /// its value from just before the hold to its final value.
    pub fn end_hold(&mut self) {
        self.hold_depth = self.hold_depth.saturating_sub(1);
        if self.hold_depth == 0 {
            let pending = std::mem::take(&mut self.pending);
            for (name, old) in pending {
                let new = self.value(&name);
                if old != new {
                    self.fire(&name, &old, &new);
                }
            }
        }
    }

    /// Convenience wrapper running `f` with changes held, then flushing.
    pub fn with_held_changes<F: FnOnce(&mut Self)>(&mut self, f: F) {
        self.begin_hold();
        f(self);
        self.end_hold();
    }

    pub fn export_dict(&self) -> HashMap<String, serde_json::Value> {
        self.values
            .iter()
            .filter_map(|(k, v)| match v {
                FieldValue::Value(json) => Some((k.clone(), json.clone())),
                FieldValue::Undefined => None,
            })
            .collect()
    }

    pub fn import_dict(&mut self, values: HashMap<String, serde_json::Value>) {
        for (name, json) in values {
            if self.fields.contains_key(&name) {
                let _ = self.set_value(&name, FieldValue::Value(json));
            }
        }
    }
}
