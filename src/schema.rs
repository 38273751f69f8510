use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use anyhow::{Result, anyhow, bail};
use serde::Deserialize;

use crate::dsl::{Connection, MaterialDocument, Node, NodePort, parse_str};

const DEFAULT_NODE_SCHEME_JSON: &str = include_str!("../assets/shader-node-scheme.json");

static DEFAULT_SCHEME: OnceLock<NodeScheme> = OnceLock::new();

/// Catalog of the shader node types the host adapter knows how to instantiate.
#[derive(Debug, Clone)]
pub struct NodeScheme {
    pub nodes: HashMap<String, NodeTypeScheme>,
    pub port_type_compatibility: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeneratedNodeScheme {
    #[serde(rename = "schemaVersion")]
    #[allow(dead_code)]
    pub schema_version: u32,
    #[serde(rename = "portTypeCompatibility", default)]
    pub port_type_compatibility: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub nodes: Vec<GeneratedNodeDef>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeneratedNodeDef {
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub inputs: Vec<SchemePort>,
    #[serde(default)]
    pub outputs: Vec<SchemePort>,
    #[serde(rename = "defaultParams", default)]
    pub default_params: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemePort {
    pub id: String,
    #[serde(rename = "type")]
    pub port_type: String,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// Ports keep declaration order: traversal priorities depend on it.
#[derive(Debug, Clone)]
pub struct NodeTypeScheme {
    pub category: Option<String>,
    pub inputs: Vec<SchemePort>,
    pub outputs: Vec<SchemePort>,
    pub default_params: HashMap<String, serde_json::Value>,
}

impl NodeTypeScheme {
    pub fn input_ports(&self) -> Vec<NodePort> {
        self.inputs.iter().map(to_node_port).collect()
    }

    pub fn output_ports(&self) -> Vec<NodePort> {
        self.outputs.iter().map(to_node_port).collect()
    }
}

fn to_node_port(p: &SchemePort) -> NodePort {
    NodePort {
        id: p.id.clone(),
        port_type: Some(p.port_type.clone()),
        default_value: p.default.clone(),
    }
}

pub fn load_default_scheme() -> Result<&'static NodeScheme> {
    if let Some(scheme) = DEFAULT_SCHEME.get() {
        return Ok(scheme);
    }
    let scheme: GeneratedNodeScheme = serde_json::from_str(DEFAULT_NODE_SCHEME_JSON)
        .map_err(|e| anyhow!("failed to parse assets/shader-node-scheme.json: {e}"))?;

    let mut nodes: HashMap<String, NodeTypeScheme> = HashMap::new();
    for n in scheme.nodes {
        nodes.insert(
            n.node_type,
            NodeTypeScheme {
                category: n.category,
                inputs: n.inputs,
                outputs: n.outputs,
                default_params: n.default_params,
            },
        );
    }
    Ok(DEFAULT_SCHEME.get_or_init(|| NodeScheme {
        nodes,
        port_type_compatibility: scheme.port_type_compatibility,
    }))
}

/// Compatibility table is keyed by *destination/input* type:
/// `"color": ["color", "float"]` means a color input accepts float outputs.
pub(crate) fn port_types_compatible(scheme: &NodeScheme, from_ty: &str, to_ty: &str) -> bool {
    if from_ty == "any" || to_ty == "any" || from_ty == to_ty {
        return true;
    }
    scheme
        .port_type_compatibility
        .get(to_ty)
        .is_some_and(|allowed| allowed.iter().any(|s| s == from_ty))
}

pub fn validate_document(doc: &MaterialDocument) -> Result<()> {
    let scheme = load_default_scheme()?;
    validate_document_against(doc, scheme)
}

pub fn validate_document_against(doc: &MaterialDocument, scheme: &NodeScheme) -> Result<()> {
    let mut nodes_by_id: HashMap<&str, &Node> = HashMap::new();
    let mut errors: Vec<String> = Vec::new();

    for n in &doc.nodes {
        if nodes_by_id.insert(n.id.as_str(), n).is_some() {
            errors.push(format!("duplicate node id '{}'", n.id));
        }
        // Unknown types are accepted when the instance carries its own ports.
        if !scheme.nodes.contains_key(&n.node_type) && n.inputs.is_empty() && n.outputs.is_empty() {
            errors.push(format!(
                "unknown node type '{}' at node '{}'",
                n.node_type, n.id
            ));
        }
        if n.node_type == "ImageTexture" {
            if let Some(image_id) = parse_str(&n.params, "image") {
                if !doc.images.contains_key(image_id) {
                    errors.push(format!(
                        "ImageTexture '{}' references missing image '{}'",
                        n.id, image_id
                    ));
                }
            }
        }
    }

    let mut linked_inputs: HashSet<(&str, &str)> = HashSet::new();
    for c in &doc.connections {
        if !linked_inputs.insert((c.to.node_id.as_str(), c.to.port_id.as_str())) {
            errors.push(format!(
                "input '{}.{}' has more than one incoming connection",
                c.to.node_id, c.to.port_id
            ));
        }
        validate_connection(c, &nodes_by_id, scheme, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!(
            "material failed scheme validation ({} error(s)):\n- {}",
            errors.len(),
            errors.join("\n- ")
        )
    }
}

/// Port type for `port_id`, looking at instance ports first and the scheme second.
pub(crate) fn port_type<'a>(
    scheme: &'a NodeScheme,
    node: &'a Node,
    port_id: &str,
    output: bool,
) -> Option<&'a str> {
    let instance = if output { &node.outputs } else { &node.inputs };
    if let Some(p) = instance.iter().find(|p| p.id == port_id) {
        return Some(p.port_type.as_deref().unwrap_or("any"));
    }
    let node_scheme = scheme.nodes.get(&node.node_type)?;
    let ports = if output {
        &node_scheme.outputs
    } else {
        &node_scheme.inputs
    };
    ports
        .iter()
        .find(|p| p.id == port_id)
        .map(|p| p.port_type.as_str())
}

fn validate_connection(
    c: &Connection,
    nodes_by_id: &HashMap<&str, &Node>,
    scheme: &NodeScheme,
    errors: &mut Vec<String>,
) {
    let Some(from_node) = nodes_by_id.get(c.from.node_id.as_str()).copied() else {
        errors.push(format!(
            "connection '{}' references missing from.nodeId '{}'",
            c.id, c.from.node_id
        ));
        return;
    };
    let Some(to_node) = nodes_by_id.get(c.to.node_id.as_str()).copied() else {
        errors.push(format!(
            "connection '{}' references missing to.nodeId '{}'",
            c.id, c.to.node_id
        ));
        return;
    };

    let Some(from_ty) = port_type(scheme, from_node, &c.from.port_id, true) else {
        errors.push(format!(
            "connection '{}' uses unknown from port '{}.{}' (type {})",
            c.id, c.from.node_id, c.from.port_id, from_node.node_type
        ));
        return;
    };
    let Some(to_ty) = port_type(scheme, to_node, &c.to.port_id, false) else {
        errors.push(format!(
            "connection '{}' uses unknown to port '{}.{}' (type {})",
            c.id, c.to.node_id, c.to.port_id, to_node.node_type
        ));
        return;
    };

    if !port_types_compatible(scheme, from_ty, to_ty) {
        errors.push(format!(
            "connection '{}' type mismatch: '{}.{}' ({}) -> '{}.{}' ({})",
            c.id, c.from.node_id, c.from.port_id, from_ty, c.to.node_id, c.to.port_id, to_ty
        ));
    }
}
