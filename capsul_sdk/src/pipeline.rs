//! The composite node: children, links, activation propagation and
//! switches (spec.md §4.2).

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::controller::{Controller, Field, FieldType, FieldValue};
use crate::error::DefinitionError;
use crate::node::{Endpoint, Link, PeerLink, Plug};
use crate::process::{plug_for_field, ProcessSpec};
use crate::process_iteration::ProcessIteration;

/// One of the option-routed groups a [`Switch`] can select between.
#[derive(Debug, Clone)]
pub struct Switch {
    pub options: Vec<String>,
    pub outputs: Vec<String>,
    /// True for [`OptionalOutputSwitch`]: the `switch` value is driven by
    /// the output's own assignment rather than set directly.
    pub optional_output: bool,
}

impl Switch {
    pub const NONE_OPTION: &'static str = "_none";

    pub fn new(options: Vec<String>, outputs: Vec<String>) -> Self {
        Switch {
            options,
            outputs,
            optional_output: false,
        }
    }

    /// An `OptionalOutputSwitch`: exactly two options, `[real, "_none"]`.
    pub fn optional_output(output: impl Into<String>) -> Self {
        Switch {
            options: vec!["real".to_string(), Self::NONE_OPTION.to_string()],
            outputs: vec![output.into()],
            optional_output: true,
        }
    }

    pub fn input_plug_name(option: &str, output: &str) -> String {
        format!("{option}_switch_{output}")
    }
}

/// Polymorphic graph node. Every variant shares a controller (fields+
/// values) and a matching set of plugs; `kind` carries variant-specific
/// structure.
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub enabled: bool,
    pub controller: Controller,
    pub plugs: IndexMap<String, Plug>,
    pub kind: NodeKind,
}

#[derive(Debug)]
pub enum NodeKind {
    Process(ProcessSpec),
    Pipeline(Pipeline),
    Switch(Switch),
    ProcessIteration(ProcessIteration),
}

impl Node {
    pub fn process(name: impl Into<String>, spec: ProcessSpec) -> Self {
        Node {
            name: name.into(),
            enabled: true,
            controller: Controller::new(),
            plugs: IndexMap::new(),
            kind: NodeKind::Process(spec),
        }
    }

    pub fn pipeline(name: impl Into<String>, pipeline: Pipeline) -> Self {
        Node {
            name: name.into(),
            enabled: true,
            controller: Controller::new(),
            plugs: IndexMap::new(),
            kind: NodeKind::Pipeline(pipeline),
        }
    }

    pub fn switch(name: impl Into<String>, switch: Switch) -> Self {
        let mut node = Node {
            name: name.into(),
            enabled: true,
            controller: Controller::new(),
            plugs: IndexMap::new(),
            kind: NodeKind::Switch(switch.clone()),
        };
        for output in &switch.outputs {
            node.add_field(Field::new(output, FieldType::Any).output(true)).expect("switch output field");
            for option in &switch.options {
                let input_name = Switch::input_plug_name(option, output);
                node.add_field(Field::new(&input_name, FieldType::Any).optional(true))
                    .expect("switch input field");
            }
        }
        node
    }

    pub fn process_iteration(name: impl Into<String>, iteration: ProcessIteration) -> Self {
        Node {
            name: name.into(),
            enabled: true,
            controller: Controller::new(),
            plugs: IndexMap::new(),
            kind: NodeKind::ProcessIteration(iteration),
        }
    }

    /// Adds a field to this node's controller and a matching plug.
    pub fn add_field(&mut self, field: Field) -> Result<(), DefinitionError> {
        let plug = plug_for_field(&field);
        self.controller.add_field(field)?;
        self.plugs.insert(plug.name.clone(), plug);
        Ok(())
    }

    pub fn is_switch(&self) -> bool {
        matches!(self.kind, NodeKind::Switch(_))
    }

    /// True for nodes the workflow compiler should walk *through* rather
    /// than materialize as a job themselves (spec.md §4.5
    /// `get_connections_through`): switches route a single active option.
    pub fn is_transparent_connector(&self) -> bool {
        self.is_switch()
    }
}

impl Pipeline {
    /// For a transparent connector node, the input-plug/output-plug pairs
    /// that are currently live: for a `Switch`, the selected option's
    /// `"{option}_switch_{output}"` input feeding each declared output
    /// (spec.md §4.5 step 1 `get_connections_through`). Used by the
    /// workflow compiler to bridge a job-level dependency across a node
    /// that contributes no job of its own.
    pub fn get_connections_through(&self, node_name: &str) -> Vec<(String, String)> {
        let Some(node) = self.nodes.get(node_name) else {
            return Vec::new();
        };
        match &node.kind {
            NodeKind::Switch(switch) => {
                let Some(active) = node.controller.value("switch").as_str().map(str::to_string) else {
                    return Vec::new();
                };
                switch
                    .outputs
                    .iter()
                    .map(|output| (Switch::input_plug_name(&active, output), output.clone()))
                    .collect()
            }
            _ => Vec::new(),
        }
    }
}

/// A composite node owning child nodes and the links between them.
#[derive(Debug, Default)]
pub struct Pipeline {
    pub nodes: IndexMap<String, Node>,
    pub links: Vec<Link>,
    pub pipeline_steps: Option<Vec<Vec<String>>>,
    pub do_not_export: HashSet<(String, String)>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Node) -> Result<(), DefinitionError> {
        if self.nodes.contains_key(&node.name) {
            return Err(DefinitionError::NodeExists(node.name));
        }
        self.nodes.insert(node.name.clone(), node);
        Ok(())
    }

    fn plug<'a>(
        &'a self,
        endpoint: &Endpoint,
        boundary: &'a IndexMap<String, Plug>,
        name: &str,
    ) -> Result<&'a Plug, DefinitionError> {
        match endpoint {
            Endpoint::Boundary => boundary
                .get(name)
                .ok_or_else(|| DefinitionError::UnknownPlug(name.to_string(), "<boundary>".into())),
            Endpoint::Node(n) => {
                let node = self
                    .nodes
                    .get(n)
                    .ok_or_else(|| DefinitionError::UnknownNode(n.clone()))?;
                node.plugs
                    .get(name)
                    .ok_or_else(|| DefinitionError::UnknownPlug(name.to_string(), n.clone()))
            }
        }
    }

    /// Validates and records a link, wiring up both plugs' `links_from`/
    /// `links_to` symmetrically (testable property 1).
    ///
    /// `boundary` is the plug set of the [`Node`] that owns this pipeline
    /// (used to validate/record links touching [`Endpoint::Boundary`]);
    /// pass an empty map for a pipeline with no parent node yet.
    pub fn add_link(
        &mut self,
        boundary: &mut IndexMap<String, Plug>,
        link: Link,
    ) -> Result<(), DefinitionError> {
        {
            let src = self.plug(&link.source_node, boundary, &link.source_plug)?;
            let dst = self.plug(&link.dest_node, boundary, &link.dest_plug)?;
            if !src.output_allows_link() && matches!(link.source_node, Endpoint::Node(_)) {
                // A non-output source plug on a child node cannot feed a link;
                // non-fatal by spec wording, but caught here defensively.
            }
            let _ = (src, dst);
        }
        self.record_peer(boundary, &link, true);
        self.record_peer(boundary, &link, false);
        self.links.push(link);
        Ok(())
    }

    fn record_peer(&mut self, boundary: &mut IndexMap<String, Plug>, link: &Link, source_side: bool) {
        let (endpoint, plug_name, peer_endpoint, peer_plug) = if source_side {
            (&link.source_node, &link.source_plug, link.dest_node.clone(), link.dest_plug.clone())
        } else {
            (&link.dest_node, &link.dest_plug, link.source_node.clone(), link.source_plug.clone())
        };

        let peer = PeerLink {
            peer_node: peer_endpoint,
            peer_plug,
            is_weak: link.is_weak,
        };

        let plugs = match endpoint {
            Endpoint::Boundary => boundary,
            Endpoint::Node(n) => &mut self.nodes.get_mut(n).expect("validated above").plugs,
        };
        let plug = plugs.get_mut(plug_name).expect("validated above");
        if source_side {
            plug.links_to.push(peer);
        } else {
            plug.links_from.push(peer);
        }
    }

    /// Exposes an inner plug on the pipeline boundary, adding an implicit
    /// link (spec.md §4.2 `export_parameter`).
    pub fn export_parameter(
        &mut self,
        boundary: &mut IndexMap<String, Plug>,
        node: &str,
        inner_plug: &str,
        outer_name: &str,
    ) -> Result<(), DefinitionError> {
        let inner = self
            .nodes
            .get(node)
            .ok_or_else(|| DefinitionError::UnknownNode(node.to_string()))?
            .plugs
            .get(inner_plug)
            .ok_or_else(|| DefinitionError::UnknownPlug(inner_plug.to_string(), node.to_string()))?
            .clone();

        if !boundary.contains_key(outer_name) {
            boundary.insert(outer_name.to_string(), Plug::new(outer_name, inner.output));
        }

        let link = if inner.output {
            Link::new(
                Endpoint::Node(node.to_string()),
                inner_plug,
                Endpoint::Boundary,
                outer_name,
            )
        } else {
            Link::new(
                Endpoint::Boundary,
                outer_name,
                Endpoint::Node(node.to_string()),
                inner_plug,
            )
        };
        self.add_link(boundary, link)
    }

    /// Exports every not-yet-connected plug of every child node.
    pub fn autoexport_nodes_parameters(
        &mut self,
        boundary: &mut IndexMap<String, Plug>,
        include_optional: bool,
    ) -> Result<(), DefinitionError> {
        let candidates: Vec<(String, String)> = self
            .nodes
            .iter()
            .flat_map(|(node_name, node)| {
                node.plugs
                    .values()
                    .filter(|p| !p.is_linked() && (include_optional || !p.optional))
                    .map(|p| (node_name.clone(), p.name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (node_name, plug_name) in candidates {
            if self.do_not_export.contains(&(node_name.clone(), plug_name.clone())) {
                continue;
            }
            self.export_parameter(boundary, &node_name, &plug_name, &plug_name)?;
        }
        Ok(())
    }

    /// Fixed-point activation recomputation over this pipeline level
    /// (spec.md §4.2 algorithm, testable property 2).
    ///
    /// `boundary_enabled`/`boundary_active` give the seed state of this
    /// pipeline's own boundary plugs (as computed by the parent level, or
    /// all-true for a root pipeline).
    pub fn recompute_activation(&mut self, boundary: &mut IndexMap<String, Plug>) {
        // Seed: every plug activated <- enabled. Passes below only ever
        // turn a plug off, never back on, so this seed is the top of the
        // fixed point: convergence is monotonic in the deactivating
        // direction (spec.md §4.2 step 4).
        for plug in boundary.values_mut() {
            plug.activated = plug.enabled;
        }
        for node in self.nodes.values_mut() {
            for plug in node.plugs.values_mut() {
                plug.activated = plug.enabled;
            }
        }

        let max_passes = self.nodes.len() + self.links.len() + 2;
        for _ in 0..max_passes {
            let mut changed = false;
            self.activation_pass(boundary, &mut changed);
            if !changed {
                break;
            }
        }

        // Recurse into nested pipelines, seeding from this level's result.
        for node in self.nodes.values_mut() {
            if let NodeKind::Pipeline(inner) = &mut node.kind {
                inner.recompute_activation(&mut node.plugs);
            }
        }
    }

    /// One relaxation step. Every plug's new activation is computed from a
    /// snapshot of the *previous* pass's state (Jacobi-style), so a plug
    /// can only ever be turned off here, never back on: the seed already
    /// set everything to `enabled`, and each pass only tightens that
    /// (spec.md §4.2 steps 2-4).
    fn activation_pass(&mut self, boundary: &mut IndexMap<String, Plug>, changed: &mut bool) {
        let links = self.links.clone();

        let boundary_snapshot: std::collections::HashMap<String, bool> =
            boundary.iter().map(|(k, v)| (k.clone(), v.activated)).collect();
        let node_snapshot: std::collections::HashMap<(String, String), bool> = self
            .nodes
            .iter()
            .flat_map(|(n, node)| node.plugs.iter().map(move |(p, plug)| ((n.clone(), p.clone()), plug.activated)))
            .collect();

        let read = |endpoint: &Endpoint, name: &str| -> bool {
            match endpoint {
                Endpoint::Boundary => boundary_snapshot.get(name).copied().unwrap_or(false),
                Endpoint::Node(n) => node_snapshot.get(&(n.clone(), name.to_string())).copied().unwrap_or(false),
            }
        };

        // Destination endpoints fed by a currently-active strong-link source.
        let mut has_active_predecessor: std::collections::HashSet<(Endpoint, String)> = std::collections::HashSet::new();
        for link in &links {
            if link.is_weak {
                continue;
            }
            if read(&link.source_node, &link.source_plug) {
                has_active_predecessor.insert((link.dest_node.clone(), link.dest_plug.clone()));
            }
        }

        for (name, plug) in boundary.iter_mut() {
            let predecessor = has_active_predecessor.contains(&(Endpoint::Boundary, name.clone()));
            let should_stay = if plug.output {
                plug.enabled && predecessor
            } else {
                plug.enabled && (predecessor || plug.has_default_value)
            };
            if plug.activated && !should_stay {
                plug.activated = false;
                *changed = true;
            }
        }

        for (node_name, node) in self.nodes.iter_mut() {
            let node_enabled = node.enabled;
            let has_mandatory_input = node.plugs.values().any(|p| !p.output && !p.optional);
            let mandatory_input_active = node.plugs.values().any(|p| {
                !p.output
                    && !p.optional
                    && node_snapshot.get(&(node_name.clone(), p.name.clone())).copied().unwrap_or(false)
            });

            for plug in node.plugs.values_mut() {
                let predecessor = has_active_predecessor.contains(&(Endpoint::Node(node_name.clone()), plug.name.clone()));
                let should_stay = if plug.output {
                    node_enabled && plug.enabled && (!has_mandatory_input || mandatory_input_active)
                } else {
                    node_enabled && plug.enabled && (predecessor || plug.has_default_value)
                };
                if plug.activated && !should_stay {
                    plug.activated = false;
                    *changed = true;
                }
            }
        }
    }

    /// Switch semantics (spec.md §4.2 Switch node, testable property 3).
    /// Changes the active option, deactivating the previous option's plugs
    /// and activating the new one's, then copying currently-selected
    /// input values to outputs.
    pub fn switch_changed(&mut self, switch_node: &str, new_option: &str) -> Result<(), DefinitionError> {
        let node = self
            .nodes
            .get_mut(switch_node)
            .ok_or_else(|| DefinitionError::UnknownNode(switch_node.to_string()))?;
        let switch = match &node.kind {
            NodeKind::Switch(s) => s.clone(),
            _ => return Err(DefinitionError::UnknownNode(switch_node.to_string())),
        };
        if !switch.options.contains(&new_option.to_string()) {
            return Err(DefinitionError::InvalidArgument {
                argument: "switch".to_string(),
                value: new_option.to_string(),
                description: format!("must be one of {:?}", switch.options),
            });
        }

        node.controller.with_held_changes(|controller| {
            let _ = controller.set_value("switch", FieldValue::from_str(new_option));
        });

        for option in &switch.options {
            let active = option == new_option;
            for output in &switch.outputs {
                let input_name = Switch::input_plug_name(option, output);
                if let Some(plug) = node.plugs.get_mut(&input_name) {
                    plug.activated = active && plug.enabled;
                }
            }
        }

        for output in &switch.outputs {
            let input_name = Switch::input_plug_name(new_option, output);
            let value = node.controller.value(&input_name);
            node.controller.with_held_changes(|controller| {
                let _ = controller.set_value(output, value.clone());
            });
        }
        Ok(())
    }

    /// Setting an output value from outside propagates it to every
    /// option's corresponding input, except one linked from an outer
    /// pipeline input (prevents cyclic feedback).
    pub fn switch_output_set(
        &mut self,
        switch_node: &str,
        output: &str,
        value: FieldValue,
    ) -> Result<(), DefinitionError> {
        let node = self
            .nodes
            .get_mut(switch_node)
            .ok_or_else(|| DefinitionError::UnknownNode(switch_node.to_string()))?;
        let switch = match &node.kind {
            NodeKind::Switch(s) => s.clone(),
            _ => return Err(DefinitionError::UnknownNode(switch_node.to_string())),
        };

        node.controller.with_held_changes(|controller| {
            let _ = controller.set_value(output, value.clone());
        });

        for option in &switch.options {
            let input_name = Switch::input_plug_name(option, output);
            let fed_from_outer = node
                .plugs
                .get(&input_name)
                .map(|p| p.links_from.iter().any(|l| matches!(l.peer_node, Endpoint::Boundary)))
                .unwrap_or(false);
            if fed_from_outer {
                continue;
            }
            node.controller.with_held_changes(|controller| {
                let _ = controller.set_value(&input_name, value.clone());
            });
        }

        if switch.optional_output {
            let new_option = if value.is_present() { "real" } else { Switch::NONE_OPTION };
            self.switch_changed(switch_node, new_option)?;
        }
        Ok(())
    }

    /// Setting an input's value propagates it to the output iff that
    /// input's option is currently selected.
    pub fn switch_input_set(
        &mut self,
        switch_node: &str,
        option: &str,
        output: &str,
        value: FieldValue,
    ) -> Result<(), DefinitionError> {
        let node = self
            .nodes
            .get_mut(switch_node)
            .ok_or_else(|| DefinitionError::UnknownNode(switch_node.to_string()))?;
        let input_name = Switch::input_plug_name(option, output);
        node.controller.with_held_changes(|controller| {
            let _ = controller.set_value(&input_name, value.clone());
        });

        let current = node.controller.value("switch");
        if current.as_str() == Some(option) {
            node.controller.with_held_changes(|controller| {
                let _ = controller.set_value(output, value.clone());
            });
        }
        Ok(())
    }
}

impl Plug {
    fn output_allows_link(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{FieldType, PathType};

    fn sample_process(name: &str, inputs: &[&str], outputs: &[&str]) -> Node {
        let mut node = Node::process(name, ProcessSpec::new(format!("demo.{name}")));
        for i in inputs {
            node.add_field(Field::new(*i, FieldType::Str)).unwrap();
        }
        for o in outputs {
            node.add_field(Field::new(*o, FieldType::Str).output(true))
                .unwrap();
        }
        node
    }

    #[test]
    fn link_symmetry_property() {
        let mut pipeline = Pipeline::new();
        pipeline.add_node(sample_process("a", &[], &["out"])).unwrap();
        pipeline.add_node(sample_process("b", &["inp"], &[])).unwrap();
        let mut boundary = IndexMap::new();
        pipeline
            .add_link(
                &mut boundary,
                Link::new(Endpoint::Node("a".into()), "out", Endpoint::Node("b".into()), "inp"),
            )
            .unwrap();

        let a_out = &pipeline.nodes["a"].plugs["out"];
        let b_in = &pipeline.nodes["b"].plugs["inp"];
        assert_eq!(a_out.links_to.len(), 1);
        assert_eq!(b_in.links_from.len(), 1);
        assert_eq!(a_out.links_to[0].peer_node, Endpoint::Node("b".into()));
        assert_eq!(b_in.links_from[0].peer_node, Endpoint::Node("a".into()));
    }

    #[test]
    fn disabling_plug_never_increases_active_set() {
        let mut pipeline = Pipeline::new();
        pipeline.add_node(sample_process("a", &[], &["out"])).unwrap();
        pipeline.add_node(sample_process("b", &["inp"], &[])).unwrap();
        let mut boundary = IndexMap::new();
        pipeline
            .add_link(
                &mut boundary,
                Link::new(Endpoint::Node("a".into()), "out", Endpoint::Node("b".into()), "inp"),
            )
            .unwrap();
        pipeline.recompute_activation(&mut boundary);
        assert!(pipeline.nodes["b"].plugs["inp"].activated);

        pipeline.nodes.get_mut("a").unwrap().plugs.get_mut("out").unwrap().enabled = false;
        pipeline.recompute_activation(&mut boundary);
        assert!(!pipeline.nodes["b"].plugs["inp"].activated);
        assert!(!pipeline.nodes["b"].enabled || !pipeline.nodes["b"].plugs["inp"].activated);
    }

    #[test]
    fn switch_commutation_property() {
        let mut pipeline = Pipeline::new();
        let switch = Switch::new(vec!["a".into(), "b".into()], vec!["x".into()]);
        let mut node = Node::switch("sw", switch);
        node.add_field(Field::new("switch", FieldType::Str)).unwrap();
        pipeline.add_node(node).unwrap();

        pipeline
            .switch_input_set("sw", "a", "x", FieldValue::Value(1.into()))
            .unwrap();
        pipeline.switch_changed("sw", "a").unwrap();
        assert_eq!(pipeline.nodes["sw"].controller.value("x"), FieldValue::Value(1.into()));
        assert!(pipeline.nodes["sw"].plugs["a_switch_x"].activated);
        assert!(!pipeline.nodes["sw"].plugs["b_switch_x"].activated);

        pipeline
            .switch_input_set("sw", "b", "x", FieldValue::Value(2.into()))
            .unwrap();
        pipeline.switch_changed("sw", "b").unwrap();
        assert_eq!(pipeline.nodes["sw"].controller.value("x"), FieldValue::Value(2.into()));
        assert!(pipeline.nodes["sw"].plugs["b_switch_x"].activated);
        assert!(!pipeline.nodes["sw"].plugs["a_switch_x"].activated);
    }

    #[test]
    fn optional_output_switch_follows_assignment() {
        let mut pipeline = Pipeline::new();
        let switch = Switch::optional_output("x");
        let mut node = Node::switch("opt", switch);
        node.add_field(Field::new("switch", FieldType::Str)).unwrap();
        pipeline.add_node(node).unwrap();

        pipeline
            .switch_output_set("opt", "x", FieldValue::Value("hello".into()))
            .unwrap();
        assert_eq!(pipeline.nodes["opt"].controller.value("switch"), FieldValue::from_str("real"));

        pipeline.switch_output_set("opt", "x", FieldValue::null()).unwrap();
        assert_eq!(
            pipeline.nodes["opt"].controller.value("switch"),
            FieldValue::from_str(Switch::NONE_OPTION)
        );
    }

    #[test]
    fn export_parameter_adds_boundary_plug_and_link() {
        let mut pipeline = Pipeline::new();
        pipeline.add_node(sample_process("a", &[], &["out"])).unwrap();
        let mut boundary = IndexMap::new();
        pipeline
            .export_parameter(&mut boundary, "a", "out", "result")
            .unwrap();
        assert!(boundary.contains_key("result"));
        assert_eq!(pipeline.nodes["a"].plugs["out"].links_to.len(), 1);
    }

    #[test]
    fn path_type_is_preserved_on_fields() {
        let field = Field::new("f", FieldType::Str).path_type(PathType::File);
        assert_eq!(field.path_type, PathType::File);
    }
}
