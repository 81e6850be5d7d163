//! JSON pipeline definition files (spec.md §6).

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::controller::{Field, FieldType, FieldValue};
use crate::error::DefinitionError;
use crate::node::{Endpoint, Link, Plug};
use crate::pipeline::{Node, Pipeline};
use crate::process::ProcessSpec;
use crate::process_iteration::ProcessIteration;

/// `custom_pipeline`'s nested `definition` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPipelineDefinition {
    pub executables: HashMap<String, String>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub weak_links: Vec<String>,
    #[serde(default)]
    pub export_parameters: bool,
}

/// `iterative_process`'s nested `definition` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterativeProcessDefinition {
    pub process: String,
    pub iterative_parameters: Vec<String>,
    #[serde(default)]
    pub context_name: Option<String>,
}

/// One `definition` value, shaped by the enclosing `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefinitionRef {
    Identifier(String),
    Custom(CustomPipelineDefinition),
    Iterative(IterativeProcessDefinition),
}

/// One pipeline definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineDef {
    Process {
        definition: DefinitionRef,
        #[serde(default)]
        parameters: HashMap<String, Value>,
        #[serde(default)]
        uuid: Option<String>,
    },
    Pipeline {
        definition: DefinitionRef,
        #[serde(default)]
        parameters: HashMap<String, Value>,
        #[serde(default)]
        uuid: Option<String>,
    },
    CustomPipeline {
        definition: DefinitionRef,
        #[serde(default)]
        parameters: HashMap<String, Value>,
        #[serde(default)]
        uuid: Option<String>,
    },
    IterativeProcess {
        definition: DefinitionRef,
        #[serde(default)]
        parameters: HashMap<String, Value>,
        #[serde(default)]
        uuid: Option<String>,
    },
}

impl PipelineDef {
    pub fn parameters(&self) -> &HashMap<String, Value> {
        match self {
            PipelineDef::Process { parameters, .. }
            | PipelineDef::Pipeline { parameters, .. }
            | PipelineDef::CustomPipeline { parameters, .. }
            | PipelineDef::IterativeProcess { parameters, .. } => parameters,
        }
    }

    pub fn uuid(&self) -> Option<&str> {
        match self {
            PipelineDef::Process { uuid, .. }
            | PipelineDef::Pipeline { uuid, .. }
            | PipelineDef::CustomPipeline { uuid, .. }
            | PipelineDef::IterativeProcess { uuid, .. } => uuid.as_deref(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, DefinitionError> {
        serde_json::from_str(text).map_err(|e| DefinitionError::Parsing(e.to_string()))
    }
}

/// One endpoint of a link string: `"node.plug"` or a bare `"name"` (the
/// boundary export under that name).
#[derive(Debug, Clone, PartialEq, Eq)]
struct LinkEndpointRef {
    node: Option<String>,
    plug: String,
}

impl LinkEndpointRef {
    fn parse(s: &str) -> Self {
        match s.split_once('.') {
            Some((node, plug)) => LinkEndpointRef {
                node: Some(node.to_string()),
                plug: plug.to_string(),
            },
            None => LinkEndpointRef {
                node: None,
                plug: s.to_string(),
            },
        }
    }

    fn endpoint(&self) -> Endpoint {
        match &self.node {
            Some(n) => Endpoint::Node(n.clone()),
            None => Endpoint::Boundary,
        }
    }
}

/// Parses a `"src.plug->dst.plug"` string (or a `[src, dst]` pair given
/// as `(src, dst)`) into a [`Link`]. Implicit export: if exactly one side
/// lacks a `.`, the bare side names the boundary plug it's exported
/// under rather than failing to resolve.
pub fn parse_link(src: &str, dst: &str) -> Result<Link, DefinitionError> {
    let src_ref = LinkEndpointRef::parse(src);
    let dst_ref = LinkEndpointRef::parse(dst);

    if src_ref.node.is_none() && dst_ref.node.is_none() {
        return Err(DefinitionError::Parsing(format!(
            "link '{src}' -> '{dst}' has no node on either side"
        )));
    }

    Ok(Link::new(
        src_ref.endpoint(),
        src_ref.plug,
        dst_ref.endpoint(),
        dst_ref.plug,
    ))
}

/// Parses a `"src.plug->dst.plug"` link string.
pub fn parse_link_string(spec: &str) -> Result<Link, DefinitionError> {
    let (src, dst) = spec
        .split_once("->")
        .ok_or_else(|| DefinitionError::Parsing(format!("malformed link string '{spec}'")))?;
    parse_link(src.trim(), dst.trim())
}

/// Builds a live [`Pipeline`] (and its boundary plug set) from a parsed
/// [`PipelineDef`] — the node graph a JSON-defined custom pipeline
/// compiles to, built from the same registry identifiers plus the
/// structured JSON (spec.md §9 "JSON-defined custom pipelines"). Fields
/// referenced only by a link or parameter, with no schema to draw on
/// from the (dynamically resolved) process definition, are created as
/// `FieldType::Any`.
pub fn build_pipeline(def: &PipelineDef) -> Result<(Pipeline, IndexMap<String, Plug>), DefinitionError> {
    let mut pipeline = Pipeline::new();
    let mut boundary = IndexMap::new();

    match def {
        PipelineDef::CustomPipeline { definition: DefinitionRef::Custom(custom), parameters, .. } => {
            for (name, definition_id) in &custom.executables {
                pipeline.add_node(Node::process(name, ProcessSpec::new(definition_id)))?;
            }

            for link_str in custom.links.iter().chain(custom.weak_links.iter()) {
                let is_weak = custom.weak_links.contains(link_str);
                let mut link = parse_link_string(link_str)?;
                link.is_weak = is_weak;
                ensure_node_field(&mut pipeline, &link.source_node, &link.source_plug, true)?;
                ensure_node_field(&mut pipeline, &link.dest_node, &link.dest_plug, false)?;
                ensure_boundary_plug(&mut boundary, &link);
                pipeline.add_link(&mut boundary, link)?;
            }

            apply_parameters(&mut pipeline, parameters)?;
            if custom.export_parameters {
                pipeline.autoexport_nodes_parameters(&mut boundary, true)?;
            }
        }
        PipelineDef::Process { definition: DefinitionRef::Identifier(id), parameters, .. } => {
            pipeline.add_node(Node::process("process", ProcessSpec::new(id)))?;
            apply_parameters(&mut pipeline, parameters)?;
            pipeline.autoexport_nodes_parameters(&mut boundary, true)?;
        }
        PipelineDef::IterativeProcess { definition: DefinitionRef::Iterative(iter_def), parameters, .. } => {
            let iteration = ProcessIteration::new(iter_def.process.clone(), iter_def.iterative_parameters.clone());
            pipeline.add_node(Node::process_iteration("process", iteration))?;
            apply_parameters(&mut pipeline, parameters)?;
            pipeline.autoexport_nodes_parameters(&mut boundary, true)?;
        }
        _ => {
            return Err(DefinitionError::Parsing(
                "pipeline-by-reference definitions are not resolvable; no pipeline registry exists".to_string(),
            ))
        }
    }

    pipeline.recompute_activation(&mut boundary);
    Ok((pipeline, boundary))
}

/// Adds a field to `endpoint`'s node (as `FieldType::Any`) if it doesn't
/// already carry a plug by that name, so a link can reference a field
/// the registry's process definition doesn't expose a schema for.
fn ensure_node_field(
    pipeline: &mut Pipeline,
    endpoint: &Endpoint,
    plug_name: &str,
    is_output: bool,
) -> Result<(), DefinitionError> {
    if let Endpoint::Node(name) = endpoint {
        let node = pipeline
            .nodes
            .get_mut(name)
            .ok_or_else(|| DefinitionError::UnknownNode(name.clone()))?;
        if !node.plugs.contains_key(plug_name) {
            node.add_field(Field::new(plug_name, FieldType::Any).output(is_output))?;
        }
    }
    Ok(())
}

/// Registers a boundary plug for a link's bare endpoint, if one isn't
/// already present. A boundary plug fed by a node output is itself an
/// output plug; one feeding a node input is an input plug (mirrors
/// [`Pipeline::export_parameter`]'s convention).
fn ensure_boundary_plug(boundary: &mut IndexMap<String, Plug>, link: &Link) {
    if link.source_node == Endpoint::Boundary && !boundary.contains_key(&link.source_plug) {
        boundary.insert(link.source_plug.clone(), Plug::new(&link.source_plug, false));
    }
    if link.dest_node == Endpoint::Boundary && !boundary.contains_key(&link.dest_plug) {
        boundary.insert(link.dest_plug.clone(), Plug::new(&link.dest_plug, true));
    }
}

/// Applies `"node.field": value` (or, for a single-node pipeline, bare
/// `"field": value`) parameter entries, creating the field first if the
/// node doesn't already carry it.
fn apply_parameters(pipeline: &mut Pipeline, parameters: &HashMap<String, Value>) -> Result<(), DefinitionError> {
    for (key, value) in parameters {
        let (node_name, field_name) = match key.split_once('.') {
            Some((n, f)) => (n.to_string(), f.to_string()),
            None if pipeline.nodes.len() == 1 => (pipeline.nodes.keys().next().unwrap().clone(), key.clone()),
            None => return Err(DefinitionError::UnknownField(key.clone())),
        };
        let node = pipeline
            .nodes
            .get_mut(&node_name)
            .ok_or_else(|| DefinitionError::UnknownNode(node_name.clone()))?;
        if !node.plugs.contains_key(&field_name) {
            node.add_field(Field::new(&field_name, FieldType::Any))?;
        }
        node.controller.set_value(&field_name, FieldValue::Value(value.clone()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_process_definition() {
        let json = r#"{"type":"process","definition":"demo.module.Proc","parameters":{"x":1}}"#;
        let def = PipelineDef::from_json(json).unwrap();
        assert_eq!(def.parameters().get("x"), Some(&Value::from(1)));
    }

    #[test]
    fn parses_custom_pipeline_definition() {
        let json = r#"{
            "type":"custom_pipeline",
            "definition":{
                "executables":{"a":"demo.A","b":"demo.B"},
                "links":["a.out->b.in"],
                "export_parameters":true
            }
        }"#;
        let def = PipelineDef::from_json(json).unwrap();
        match def {
            PipelineDef::CustomPipeline { definition: DefinitionRef::Custom(c), .. } => {
                assert_eq!(c.executables.len(), 2);
                assert!(c.export_parameters);
            }
            _ => panic!("expected custom pipeline"),
        }
    }

    #[test]
    fn link_string_with_explicit_nodes() {
        let link = parse_link_string("a.out -> b.in").unwrap();
        assert_eq!(link.source_node, Endpoint::Node("a".into()));
        assert_eq!(link.dest_node, Endpoint::Node("b".into()));
    }

    #[test]
    fn implicit_export_when_one_side_is_bare() {
        let link = parse_link_string("a.out -> result").unwrap();
        assert_eq!(link.source_node, Endpoint::Node("a".into()));
        assert_eq!(link.dest_node, Endpoint::Boundary);
        assert_eq!(link.dest_plug, "result");
    }

    #[test]
    fn rejects_link_with_no_node_on_either_side() {
        assert!(parse_link_string("foo -> bar").is_err());
    }

    #[test]
    fn custom_pipeline_definition_builds_linked_nodes() {
        let json = r#"{
            "type":"custom_pipeline",
            "definition":{
                "executables":{"a":"demo.A","b":"demo.B"},
                "links":["a.out->b.in"],
                "export_parameters":true
            },
            "parameters":{"a.in":"/data/x.nii"}
        }"#;
        let def = PipelineDef::from_json(json).unwrap();
        let (pipeline, boundary) = build_pipeline(&def).unwrap();

        assert_eq!(pipeline.nodes.len(), 2);
        // The explicit a.out->b.in link, plus one export link for a's
        // otherwise-unconnected "in" parameter field.
        assert_eq!(pipeline.links.len(), 2);
        let explicit = pipeline
            .links
            .iter()
            .find(|l| l.source_node == Endpoint::Node("a".into()) && l.dest_node == Endpoint::Node("b".into()))
            .expect("explicit link between a and b");
        assert_eq!(explicit.source_plug, "out");
        assert_eq!(explicit.dest_plug, "in");

        assert_eq!(
            pipeline.nodes["a"].controller.value("in"),
            FieldValue::from_str("/data/x.nii")
        );
        assert!(boundary.contains_key("in"), "autoexport should expose a's unlinked input");
    }

    #[test]
    fn process_definition_builds_single_node_with_parameters() {
        let json = r#"{"type":"process","definition":"demo.module.Proc","parameters":{"x":1}}"#;
        let def = PipelineDef::from_json(json).unwrap();
        let (pipeline, boundary) = build_pipeline(&def).unwrap();

        assert_eq!(pipeline.nodes.len(), 1);
        let node = pipeline.nodes.values().next().unwrap();
        assert_eq!(node.controller.value("x"), FieldValue::Value(serde_json::json!(1)));
        assert!(boundary.contains_key("x"));
    }

    #[test]
    fn iterative_process_definition_builds_a_process_iteration_node() {
        let json = r#"{
            "type":"iterative_process",
            "definition":{"process":"demo.module.Proc","iterative_parameters":["in"]},
            "parameters":{"in":["/a","/b"]}
        }"#;
        let def = PipelineDef::from_json(json).unwrap();
        let (pipeline, _boundary) = build_pipeline(&def).unwrap();

        let node = pipeline.nodes.values().next().unwrap();
        assert!(matches!(node.kind, crate::pipeline::NodeKind::ProcessIteration(_)));
    }

    #[test]
    fn pipeline_by_reference_is_rejected_for_lack_of_a_registry() {
        let json = r#"{"type":"pipeline","definition":"demo.module.SomePipeline"}"#;
        let def = PipelineDef::from_json(json).unwrap();
        assert!(build_pipeline(&def).is_err());
    }
}
