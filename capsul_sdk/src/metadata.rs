//! Per-process metadata modifiers and path resolution (spec.md §4.4).

use std::collections::HashMap;

use crate::dataset::{Dataset, MetadataSchema, SchemaMapping};
use crate::error::CompletionError;
use crate::pipeline::{NodeKind, Pipeline};

/// One recorded edit from a [`ProcessSchema`] modifier: `set`, `unused`,
/// `append` or `prepend` on a `(parameter, attribute)` pair. Parameter
/// selectors may use glob patterns matched against exported names.
#[derive(Debug, Clone)]
pub enum ModificationAction {
    Set(String),
    Unused,
    Append(String, String),
    Prepend(String, String),
}

/// Recorder passed to a [`ProcessSchema`] modifier callback.
#[derive(Debug, Default)]
pub struct MetadataModification {
    actions: Vec<(String, String, ModificationAction)>,
}

impl MetadataModification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, parameter_glob: &str, attribute: &str, value: impl Into<String>) {
        self.actions.push((
            parameter_glob.to_string(),
            attribute.to_string(),
            ModificationAction::Set(value.into()),
        ));
    }

    pub fn unused(&mut self, parameter_glob: &str, attribute: &str) {
        self.actions.push((
            parameter_glob.to_string(),
            attribute.to_string(),
            ModificationAction::Unused,
        ));
    }

    pub fn append(&mut self, parameter_glob: &str, attribute: &str, value: impl Into<String>, sep: impl Into<String>) {
        self.actions.push((
            parameter_glob.to_string(),
            attribute.to_string(),
            ModificationAction::Append(value.into(), sep.into()),
        ));
    }

    pub fn prepend(&mut self, parameter_glob: &str, attribute: &str, value: impl Into<String>, sep: impl Into<String>) {
        self.actions.push((
            parameter_glob.to_string(),
            attribute.to_string(),
            ModificationAction::Prepend(value.into(), sep.into()),
        ));
    }

    /// Applies every recorded action whose glob matches `parameter` to
    /// `metadata`/`unused`.
    fn apply_to(
        &self,
        parameter: &str,
        metadata: &mut HashMap<String, String>,
        unused: &mut HashMap<String, bool>,
    ) {
        for (glob, attribute, action) in &self.actions {
            if !glob_matches(glob, parameter) {
                continue;
            }
            match action {
                ModificationAction::Set(value) => {
                    metadata.insert(attribute.clone(), value.clone());
                }
                ModificationAction::Unused => {
                    unused.insert(attribute.clone(), true);
                }
                ModificationAction::Append(value, sep) => {
                    let entry = metadata.entry(attribute.clone()).or_default();
                    if entry.is_empty() {
                        *entry = value.clone();
                    } else {
                        entry.push_str(sep);
                        entry.push_str(value);
                    }
                }
                ModificationAction::Prepend(value, sep) => {
                    let entry = metadata.entry(attribute.clone()).or_default();
                    if entry.is_empty() {
                        *entry = value.clone();
                    } else {
                        *entry = format!("{value}{sep}{entry}");
                    }
                }
            }
        }
    }
}

fn glob_matches(glob: &str, name: &str) -> bool {
    if glob == "*" {
        return true;
    }
    match (glob.strip_prefix('*'), glob.strip_suffix('*')) {
        (Some(suffix), _) if glob.starts_with('*') => name.ends_with(suffix),
        (_, Some(prefix)) if glob.ends_with('*') => name.starts_with(prefix),
        _ => glob == name,
    }
}

type Modifier = Box<dyn Fn(&mut MetadataModification) + Send + Sync>;

/// `{schema, process_definition, modifier}` registered entries, keyed by
/// `(schema_name, process_definition)`.
#[derive(Default)]
pub struct ProcessSchemaRegistry {
    entries: HashMap<(String, String), Modifier>,
}

impl ProcessSchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        schema: impl Into<String>,
        process_definition: impl Into<String>,
        modifier: impl Fn(&mut MetadataModification) + Send + Sync + 'static,
    ) {
        self.entries
            .insert((schema.into(), process_definition.into()), Box::new(modifier));
    }

    fn get(&self, schema: &str, process_definition: &str) -> Option<&Modifier> {
        self.entries.get(&(schema.to_string(), process_definition.to_string()))
    }
}

/// Resolved metadata for a pipeline: `metadata[parameter][attribute] →
/// value` and `unused[parameter][attribute] → bool` (spec.md §4.4
/// `resolve_process_schema`).
#[derive(Debug, Default)]
pub struct ResolvedSchema {
    pub metadata: HashMap<String, HashMap<String, String>>,
    pub unused: HashMap<String, HashMap<String, bool>>,
}

/// Walks `pipeline` (recursing into sub-pipelines), invoking every
/// registered modifier for `(schema_name, node.definition)`.
pub fn resolve_process_schema(
    registry: &ProcessSchemaRegistry,
    schema_name: &str,
    pipeline: &Pipeline,
) -> ResolvedSchema {
    let mut resolved = ResolvedSchema::default();
    walk_for_schema(registry, schema_name, pipeline, "", &mut resolved);
    resolved
}

fn walk_for_schema(
    registry: &ProcessSchemaRegistry,
    schema_name: &str,
    pipeline: &Pipeline,
    prefix: &str,
    resolved: &mut ResolvedSchema,
) {
    for (node_name, node) in &pipeline.nodes {
        let definition = match &node.kind {
            NodeKind::Process(spec) => Some(spec.definition.clone()),
            NodeKind::ProcessIteration(iteration) => Some(iteration.base_definition.clone()),
            _ => None,
        };
        if let Some(definition) = definition {
            if let Some(modifier) = registry.get(schema_name, &definition) {
                let mut recorder = MetadataModification::new();
                modifier(&mut recorder);
                for plug_name in node.plugs.keys() {
                    let parameter = format!("{prefix}{node_name}.{plug_name}");
                    let metadata = resolved.metadata.entry(parameter.clone()).or_default();
                    let unused = resolved.unused.entry(parameter).or_default();
                    recorder.apply_to(plug_name, metadata, unused);
                }
            }
        }
        if let NodeKind::Pipeline(inner) = &node.kind {
            walk_for_schema(registry, schema_name, inner, &format!("{prefix}{node_name}."), resolved);
        }
    }
}

/// Associates each path-typed parameter with a resolved dataset path
/// (spec.md §4.4 per-parameter dataset resolution order) and produces
/// concrete paths for every parameter, honoring explicit overrides, field
/// metadata, parent propagation, and the `input`/`output` fallback.
pub struct ProcessMetadata<'a> {
    pub datasets: &'a HashMap<String, Dataset>,
    pub schemas: &'a HashMap<String, Box<dyn MetadataSchema>>,
    pub mappings: &'a [SchemaMapping],
    pub registry: &'a ProcessSchemaRegistry,
}

impl<'a> ProcessMetadata<'a> {
    /// Resolves the dataset name for one plug, per the precedence order:
    /// explicit override, field metadata, parent propagation, fallback.
    pub fn dataset_for_parameter(
        &self,
        explicit: Option<&str>,
        field_dataset: Option<&str>,
        parent_dataset: Option<&str>,
        is_output: bool,
    ) -> String {
        explicit
            .or(field_dataset)
            .or(parent_dataset)
            .map(str::to_string)
            .unwrap_or_else(|| if is_output { "output".to_string() } else { "input".to_string() })
    }

    /// For one parameter, builds a schema instance seeded from the
    /// dataset's global attributes, applies the per-parameter metadata
    /// map, converts via any applicable [`SchemaMapping`], then returns
    /// `build_param`'s result (spec.md §4.4 `generate_paths`).
    ///
    /// The result may still contain unexpanded placeholders of the form
    /// `!{dataset.<name>.path}`; see [`resolve_paths`].
    pub fn build_parameter_path(
        &self,
        dataset_name: &str,
        global_attrs: &HashMap<String, String>,
        parameter: &str,
        resolved: &ResolvedSchema,
        is_path: bool,
    ) -> Result<String, CompletionError> {
        let dataset = self
            .datasets
            .get(dataset_name)
            .ok_or_else(|| CompletionError::UnresolvedDataset(parameter.to_string()))?;
        let schema = self
            .schemas
            .get(&dataset.schema_name)
            .ok_or_else(|| CompletionError::MissingSchema(dataset.schema_name.clone()))?;

        let mut attrs = global_attrs.clone();
        if let Some(per_param) = resolved.metadata.get(parameter) {
            for (attribute, value) in per_param {
                attrs.insert(attribute.clone(), value.clone());
            }
        }

        for mapping in self.mappings {
            if mapping.dest_schema == dataset.schema_name {
                let source_attrs = attrs.clone();
                mapping.map_schemas(&source_attrs, &mut attrs);
            }
        }

        let unused: Vec<String> = resolved
            .unused
            .get(parameter)
            .map(|u| u.iter().filter(|(_, v)| **v).map(|(k, _)| k.clone()).collect())
            .unwrap_or_default();

        for attribute in schema.fields() {
            if !unused.contains(&attribute.to_string()) && !attrs.contains_key(*attribute) {
                return Err(CompletionError::MandatoryAttributeMissing {
                    parameter: parameter.to_string(),
                    attribute: attribute.to_string(),
                });
            }
        }

        Ok(format!(
            "!{{dataset.{dataset_name}.path}}/{}",
            schema.build_param(&dataset.path, is_path, &attrs, &unused).trim_start_matches(&format!("{}/", dataset.path))
        ))
    }
}

/// Textual substitution of `!{dataset.<name>.path}` / `!{<module>.directory}`
/// placeholders against an active execution context (spec.md §4.4
/// `resolve_paths`).
pub fn resolve_paths(template: &str, context: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'!' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = template[i..].find('}') {
                let key = &template[i + 2..i + end];
                if let Some(value) = context.get(key) {
                    out.push_str(value);
                    i += end + 1;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{Field, FieldType};
    use crate::dataset::BrainvisaSchema;
    use crate::process::ProcessSpec;

    fn process_node(name: &str, definition: &str, outputs: &[&str]) -> crate::pipeline::Node {
        let mut node = crate::pipeline::Node::process(name, ProcessSpec::new(definition));
        for output in outputs {
            node.add_field(Field::new(*output, FieldType::Str).output(true)).unwrap();
        }
        node
    }

    /// S1 (spec.md worked example): a scalar `TinyMorphologist` run with
    /// `normalization="none"` over subject `aleksander`, session `m0`,
    /// center `whatever`. Exercises the full `generate_paths` path end to
    /// end: `ProcessSchemaRegistry` lookup by `(schema, process
    /// definition)`, `resolve_process_schema` walking a real `Pipeline`,
    /// `MetadataModification` prepend/append chaining, `BrainvisaSchema`
    /// directory and filename construction, and `resolve_paths`
    /// placeholder substitution — against the pipeline's exact expected
    /// output paths.
    ///
    /// Each registered modifier encodes its output's full accumulated
    /// `prefix` chain directly (e.g. hemisphere registers
    /// `"hemi_split_nobias"`, not just `"hemi"`): `ProcessMetadata`
    /// resolves every parameter independently and does not itself
    /// propagate attribute values along pipeline links the way a node's
    /// own upstream execution would, so the chain is supplied by each
    /// node's schema the same way a hand-written `ProcessSchema` would
    /// encode "what I am downstream of".
    #[test]
    fn s1_scalar_pipeline_produces_expected_brainvisa_paths() {
        let mut registry = ProcessSchemaRegistry::new();
        registry.register("brainvisa", "test.bias_correction", |m| {
            m.unused("*", "analysis");
            m.prepend("*", "prefix", "nobias", "_");
        });
        registry.register("brainvisa", "test.hemisphere", |m| {
            m.unused("*", "analysis");
            m.prepend("*", "prefix", "hemi_split_nobias", "_");
            m.append("right_output", "suffix", "right", "_");
            m.append("left_output", "suffix", "left", "_");
        });

        let mut pipeline = Pipeline::new();
        pipeline.add_node(process_node("nobias", "test.bias_correction", &["output"])).unwrap();
        pipeline.add_node(process_node("split", "test.hemisphere", &["right_output", "left_output"])).unwrap();

        let resolved = resolve_process_schema(&registry, "brainvisa", &pipeline);

        let mut datasets = HashMap::new();
        datasets.insert("output".to_string(), Dataset::new("/out", "brainvisa"));
        let mut schemas: HashMap<String, Box<dyn MetadataSchema>> = HashMap::new();
        schemas.insert("brainvisa".to_string(), Box::new(BrainvisaSchema));
        let metadata = ProcessMetadata { datasets: &datasets, schemas: &schemas, mappings: &[], registry: &registry };

        let mut global = HashMap::new();
        global.insert("center".to_string(), "whatever".to_string());
        global.insert("subject".to_string(), "aleksander".to_string());
        global.insert("modality".to_string(), "tinymorphologist".to_string());
        global.insert("session".to_string(), "m0".to_string());

        let mut ctx = HashMap::new();
        ctx.insert("dataset.output.path".to_string(), "/out".to_string());

        let resolve = |parameter: &str| {
            resolve_paths(&metadata.build_parameter_path("output", &global, parameter, &resolved, true).unwrap(), &ctx)
        };

        assert_eq!(resolve("nobias.output"), "/out/whatever/aleksander/tinymorphologist/m0/default_analysis/nobias_aleksander.nii");
        assert_eq!(
            resolve("split.right_output"),
            "/out/whatever/aleksander/tinymorphologist/m0/default_analysis/hemi_split_nobias_aleksander_right.nii"
        );
        assert_eq!(
            resolve("split.left_output"),
            "/out/whatever/aleksander/tinymorphologist/m0/default_analysis/hemi_split_nobias_aleksander_left.nii"
        );
    }

    /// S2: same pipeline with `normalization="aims"` — the normalized
    /// output's filename prepends `normalized_aims` onto the `nobias`
    /// chain, and every downstream hemisphere path prepends `hemi_split_`
    /// onto that longer filename in turn.
    #[test]
    fn s2_aims_normalization_prepends_onto_the_nobias_chain() {
        let mut registry = ProcessSchemaRegistry::new();
        registry.register("brainvisa", "test.aims_normalization", |m| {
            m.unused("*", "analysis");
            m.prepend("*", "prefix", "normalized_aims_nobias", "_");
        });
        registry.register("brainvisa", "test.hemisphere", |m| {
            m.unused("*", "analysis");
            m.prepend("*", "prefix", "hemi_split_normalized_aims_nobias", "_");
            m.append("right_output", "suffix", "right", "_");
            m.append("left_output", "suffix", "left", "_");
        });

        let mut pipeline = Pipeline::new();
        pipeline.add_node(process_node("aims_normalization", "test.aims_normalization", &["output"])).unwrap();
        pipeline.add_node(process_node("split", "test.hemisphere", &["right_output", "left_output"])).unwrap();

        let resolved = resolve_process_schema(&registry, "brainvisa", &pipeline);

        let mut datasets = HashMap::new();
        datasets.insert("output".to_string(), Dataset::new("/out", "brainvisa"));
        let mut schemas: HashMap<String, Box<dyn MetadataSchema>> = HashMap::new();
        schemas.insert("brainvisa".to_string(), Box::new(BrainvisaSchema));
        let metadata = ProcessMetadata { datasets: &datasets, schemas: &schemas, mappings: &[], registry: &registry };

        let mut global = HashMap::new();
        global.insert("center".to_string(), "whatever".to_string());
        global.insert("subject".to_string(), "aleksander".to_string());
        global.insert("modality".to_string(), "tinymorphologist".to_string());
        global.insert("session".to_string(), "m0".to_string());

        let mut ctx = HashMap::new();
        ctx.insert("dataset.output.path".to_string(), "/out".to_string());

        let resolve = |parameter: &str| {
            resolve_paths(&metadata.build_parameter_path("output", &global, parameter, &resolved, true).unwrap(), &ctx)
        };

        assert_eq!(
            resolve("aims_normalization.output"),
            "/out/whatever/aleksander/tinymorphologist/m0/default_analysis/normalized_aims_nobias_aleksander.nii"
        );
        assert_eq!(
            resolve("split.right_output"),
            "/out/whatever/aleksander/tinymorphologist/m0/default_analysis/hemi_split_normalized_aims_nobias_aleksander_right.nii"
        );
        assert_eq!(
            resolve("split.left_output"),
            "/out/whatever/aleksander/tinymorphologist/m0/default_analysis/hemi_split_normalized_aims_nobias_aleksander_left.nii"
        );
    }

    #[test]
    fn glob_matching_prefix_suffix_exact() {
        assert!(glob_matches("*", "anything"));
        assert!(glob_matches("left_*", "left_hemisphere"));
        assert!(glob_matches("*_output", "nobias_output"));
        assert!(glob_matches("exact", "exact"));
        assert!(!glob_matches("exact", "not_exact"));
    }

    #[test]
    fn modification_append_and_prepend_join_with_separator() {
        let mut modification = MetadataModification::new();
        modification.set("*", "subject", "aleksander");
        modification.append("*", "suffix", "left", "_");
        modification.prepend("*", "suffix", "nobias", "_");

        let mut metadata = HashMap::new();
        let mut unused = HashMap::new();
        modification.apply_to("left_hemi", &mut metadata, &mut unused);
        assert_eq!(metadata.get("suffix"), Some(&"nobias_left".to_string()));
        assert_eq!(metadata.get("subject"), Some(&"aleksander".to_string()));
    }

    #[test]
    fn resolve_paths_substitutes_known_placeholders() {
        let mut ctx = HashMap::new();
        ctx.insert("dataset.output.path".to_string(), "/out".to_string());
        let resolved = resolve_paths("!{dataset.output.path}/result.nii", &ctx);
        assert_eq!(resolved, "/out/result.nii");
    }

    #[test]
    fn resolve_paths_leaves_unknown_placeholder_untouched() {
        let ctx = HashMap::new();
        let resolved = resolve_paths("!{dataset.missing.path}/x", &ctx);
        assert_eq!(resolved, "!{dataset.missing.path}/x");
    }
}
