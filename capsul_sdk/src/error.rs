//! Error taxonomy for pipeline definition and completion, per spec categories 1-2.

/// Raised during pipeline construction, node wiring or pipeline JSON loading.
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum DefinitionError {
    #[error("field '{0}' collides with a reserved node attribute")]
    ReservedFieldName(String),

    #[error("field '{0}' already exists on this node")]
    FieldExists(String),

    #[error("no such field '{0}'")]
    UnknownField(String),

    #[error("no such plug '{0}' on node '{1}'")]
    UnknownPlug(String, String),

    #[error("no such node '{0}'")]
    UnknownNode(String),

    #[error("node '{0}' already exists in this pipeline")]
    NodeExists(String),

    #[error("link {src_node}.{src_plug} -> {dst_node}.{dst_plug} has incompatible types")]
    IncompatibleLink {
        src_node: String,
        src_plug: String,
        dst_node: String,
        dst_plug: String,
    },

    #[error("link would create a activation cycle between {0} and {1}")]
    ActivationCycle(String, String),

    #[error("ambiguous module resolution for '{0}'")]
    AmbiguousResolution(String),

    #[error("invalid {argument}: '{value}'; {description}")]
    InvalidArgument {
        argument: String,
        value: String,
        description: String,
    },

    #[error("could not parse pipeline definition; {0}")]
    Parsing(String),
}

/// Raised while resolving metadata schemas and building concrete paths.
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum CompletionError {
    #[error("no schema registered under name '{0}'")]
    MissingSchema(String),

    #[error("could not resolve a dataset for parameter '{0}'")]
    UnresolvedDataset(String),

    #[error("no mapping registered from schema '{0}' to schema '{1}'")]
    IncompatibleSchemas(String, String),

    #[error("mandatory attribute '{attribute}' missing for parameter '{parameter}'")]
    MandatoryAttributeMissing { parameter: String, attribute: String },

    #[error("iterative parameters have differing lengths: {0} vs {1}")]
    IterationLengthMismatch(usize, usize),
}
