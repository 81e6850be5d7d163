//! Plugs and links: graph endpoints and the edges between them
//! (spec.md §3 Plug/Link, §4.2 link discipline).

use serde::{Deserialize, Serialize};

/// One end of a [`Link`]: either a named child node's plug, or this
/// pipeline's own boundary (an exported parameter).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Boundary,
    Node(String),
}

impl Endpoint {
    pub fn node_name(&self) -> Option<&str> {
        match self {
            Endpoint::Boundary => None,
            Endpoint::Node(n) => Some(n),
        }
    }
}

/// One entry in `links_from`/`links_to`: who this plug is connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLink {
    pub peer_node: Endpoint,
    pub peer_plug: String,
    pub is_weak: bool,
}

/// A graph endpoint mirroring a field on a node.
#[derive(Debug, Clone)]
pub struct Plug {
    pub name: String,
    pub output: bool,
    pub optional: bool,
    pub enabled: bool,
    pub activated: bool,
    pub has_default_value: bool,
    pub links_from: Vec<PeerLink>,
    pub links_to: Vec<PeerLink>,
}

impl Plug {
    pub fn new(name: impl Into<String>, output: bool) -> Self {
        Plug {
            name: name.into(),
            output,
            optional: false,
            enabled: true,
            activated: true,
            has_default_value: false,
            links_from: Vec::new(),
            links_to: Vec::new(),
        }
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn has_default_value(mut self, has_default: bool) -> Self {
        self.has_default_value = has_default;
        self
    }

    pub fn is_linked(&self) -> bool {
        !self.links_from.is_empty() || !self.links_to.is_empty()
    }
}

/// A directed edge between two plugs, at the level of one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub source_node: Endpoint,
    pub source_plug: String,
    pub dest_node: Endpoint,
    pub dest_plug: String,
    pub is_weak: bool,
}

impl Link {
    pub fn new(
        source_node: Endpoint,
        source_plug: impl Into<String>,
        dest_node: Endpoint,
        dest_plug: impl Into<String>,
    ) -> Self {
        Link {
            source_node,
            source_plug: source_plug.into(),
            dest_node,
            dest_plug: dest_plug.into(),
            is_weak: false,
        }
    }

    pub fn weak(mut self, is_weak: bool) -> Self {
        self.is_weak = is_weak;
        self
    }
}
