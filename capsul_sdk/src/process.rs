//! Atomic executable node (spec.md §2 Process, §4.5 `is_job`).

use std::collections::HashMap;
use std::fmt;

use crate::controller::FieldValue;
use crate::node::Plug;

/// Every registered process definition carries a string identifier
/// (module+name) so it can be resolved from a JSON pipeline definition —
/// see spec.md §9 "Executable loading by string".
pub trait ProcessDefinition: Send + Sync {
    fn definition_id(&self) -> &str;

    /// Builds argv for a job executing this process with the given
    /// resolved parameter values. `None` means the process is not a job
    /// (e.g. a pure in-engine computation) per spec.md §4.5 `is_job()`.
    fn command(&self, parameters: &HashMap<String, FieldValue>) -> Option<Vec<String>>;
}

/// Process-specific data carried by a [`crate::pipeline::Node`] whose kind
/// is `Process`. The node's own `controller`/`plugs` hold the fields; this
/// struct holds what makes a process a process rather than a pipeline.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub definition: String,
    /// Whether this process contributes a job at compile time. False for
    /// processes whose work happens purely inside the engine process.
    pub is_job: bool,
    /// Request execution inside a scratch directory whose contents are
    /// moved to declared outputs on success (GLOSSARY `use_temp_output_dir`).
    pub use_temp_output_dir: bool,
}

impl ProcessSpec {
    pub fn new(definition: impl Into<String>) -> Self {
        ProcessSpec {
            definition: definition.into(),
            is_job: true,
            use_temp_output_dir: false,
        }
    }
}

/// Build a [`Plug`] matching a field one-to-one, as every node kind does
/// when a field is added to its controller.
pub fn plug_for_field(field: &crate::controller::Field) -> Plug {
    Plug::new(&field.name, field.is_output)
        .optional(field.optional)
        .has_default_value(field.has_default_value())
}

impl fmt::Debug for dyn ProcessDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessDefinition({})", self.definition_id())
    }
}
