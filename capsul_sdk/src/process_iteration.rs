//! Fan-out over a base process across a list of parameter values
//! (spec.md §2 ProcessIteration, §4.2 iteration rules).

use crate::controller::FieldValue;
use crate::error::DefinitionError;

/// Wraps a base process definition, broadcasting a subset of its
/// parameters across parallel values and running one instance per index.
#[derive(Debug, Clone)]
pub struct ProcessIteration {
    pub base_definition: String,
    /// Names of fields whose value is a list, one element feeding each
    /// iteration (spec.md §2 `iterative_parameters`).
    pub iterative_parameters: Vec<String>,
}

impl ProcessIteration {
    pub fn new(base_definition: impl Into<String>, iterative_parameters: Vec<String>) -> Self {
        ProcessIteration {
            base_definition: base_definition.into(),
            iterative_parameters,
        }
    }

    /// The common length every iterative parameter's list must share.
    /// A length-1 list broadcasts to whatever length the others settle
    /// on; only two *distinct* lengths both greater than 1 are rejected
    /// (testable property: list broadcast rule).
    pub fn iteration_size(
        &self,
        values: &std::collections::HashMap<String, FieldValue>,
    ) -> Result<usize, DefinitionError> {
        let mut size = None;
        for name in &self.iterative_parameters {
            let value = values.get(name).cloned().unwrap_or_default();
            let len = value.as_list().map(|l| l.len()).unwrap_or(0);
            if len == 1 {
                continue;
            }
            match size {
                None => size = Some(len),
                Some(existing) if existing != len => {
                    return Err(DefinitionError::InvalidArgument {
                        argument: name.clone(),
                        value: len.to_string(),
                        description: format!("iterative parameters must share one length, expected {existing}"),
                    })
                }
                _ => {}
            }
        }
        Ok(size.unwrap_or(1))
    }

    /// The parameter values a single iteration instance sees: iterative
    /// parameters are indexed into (a length-1, broadcast source always
    /// yields its one element, regardless of `index`), everything else
    /// passes through as-is.
    pub fn select_iteration_index(
        &self,
        values: &std::collections::HashMap<String, FieldValue>,
        index: usize,
    ) -> std::collections::HashMap<String, FieldValue> {
        let mut selected = values.clone();
        for name in &self.iterative_parameters {
            if let Some(list) = values.get(name).and_then(|v| v.as_list()) {
                let clamped = if list.len() == 1 { 0 } else { index };
                let element = list.get(clamped).cloned().unwrap_or(serde_json::Value::Null);
                selected.insert(name.clone(), FieldValue::Value(element));
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn mismatched_iterative_lengths_rejected() {
        let iteration = ProcessIteration::new("demo.proc", vec!["a".into(), "b".into()]);
        let mut values = HashMap::new();
        values.insert("a".to_string(), FieldValue::Value(serde_json::json!([1, 2, 3])));
        values.insert("b".to_string(), FieldValue::Value(serde_json::json!([1, 2])));
        assert!(iteration.iteration_size(&values).is_err());
    }

    #[test]
    fn select_iteration_index_broadcasts_non_iterative() {
        let iteration = ProcessIteration::new("demo.proc", vec!["a".into()]);
        let mut values = HashMap::new();
        values.insert("a".to_string(), FieldValue::Value(serde_json::json!(["x", "y"])));
        values.insert("shared".to_string(), FieldValue::from_str("same"));

        let first = iteration.select_iteration_index(&values, 0);
        let second = iteration.select_iteration_index(&values, 1);
        assert_eq!(first["a"], FieldValue::from_str("x"));
        assert_eq!(second["a"], FieldValue::from_str("y"));
        assert_eq!(first["shared"], FieldValue::from_str("same"));
        assert_eq!(second["shared"], FieldValue::from_str("same"));
    }

    #[test]
    fn length_one_list_broadcasts_against_a_longer_list() {
        let iteration = ProcessIteration::new("demo.proc", vec!["a".into(), "b".into()]);
        let mut values = HashMap::new();
        values.insert("a".to_string(), FieldValue::Value(serde_json::json!([1, 2, 3])));
        values.insert("b".to_string(), FieldValue::Value(serde_json::json!(["only"])));

        assert_eq!(iteration.iteration_size(&values).unwrap(), 3);
        let third = iteration.select_iteration_index(&values, 2);
        assert_eq!(third["a"], FieldValue::Value(serde_json::json!(3)));
        assert_eq!(third["b"], FieldValue::from_str("only"), "broadcast source yields its last element past index 0");
    }
}
