use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::schema;

/// A single material's shading graph plus the image datablocks it references.
///
/// This is the on-disk stand-in for the host application's material: the graph adapters in
/// [`crate::graph`] implement the read and mutation interfaces over it.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MaterialDocument {
    pub version: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub images: BTreeMap<String, ImageData>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Metadata {
    pub name: String,
    #[serde(default, rename = "objectId")]
    pub object_id: Option<String>,
    #[serde(default, rename = "materialId")]
    pub material_id: Option<String>,
    /// Saved location of the host document; relative image paths resolve against its directory.
    #[serde(default, rename = "documentPath", skip_serializing_if = "Option::is_none")]
    pub document_path: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<[f32; 2]>,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,

    // Instance ports override the scheme's port list when present (declaration order matters).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<NodePort>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<NodePort>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct NodePort {
    pub id: String,
    #[serde(rename = "type", default)]
    pub port_type: Option<String>,
    #[serde(
        rename = "defaultValue",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub default_value: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Connection {
    pub id: String,
    pub from: Endpoint,
    pub to: Endpoint,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Endpoint {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "portId")]
    pub port_id: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ImageData {
    pub name: String,
    /// Filesystem path; `//` prefix means relative to the host document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
    /// Embedded pixel data (base64 of the encoded file).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packed: Option<String>,
    #[serde(rename = "colorSpace", default = "default_color_space")]
    pub color_space: String,
}

fn default_color_space() -> String {
    "sRGB".to_string()
}

impl MaterialDocument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: "1.0".to_string(),
            metadata: Metadata {
                name: name.into(),
                object_id: None,
                material_id: None,
                document_path: None,
            },
            nodes: Vec::new(),
            connections: Vec::new(),
            images: BTreeMap::new(),
        }
    }

    pub fn document_dir(&self) -> Option<PathBuf> {
        let p = self.metadata.document_path.as_deref()?.trim();
        if p.is_empty() {
            return None;
        }
        Path::new(p).parent().map(Path::to_path_buf)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

pub fn load_document_from_path(path: impl AsRef<Path>) -> Result<MaterialDocument> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read material json at {}", path.display()))?;
    let mut doc: MaterialDocument =
        serde_json::from_str(&text).context("failed to parse material json")?;

    // Hand-written documents often omit the document path; the file itself is the document.
    if doc.metadata.document_path.is_none() {
        let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        doc.metadata.document_path = Some(abs.display().to_string());
    }

    normalize_document_defaults(&mut doc)?;
    Ok(doc)
}

pub fn save_document_to_path(doc: &MaterialDocument, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let text = serde_json::to_string_pretty(doc).context("failed to serialize material json")?;
    std::fs::write(path, text)
        .with_context(|| format!("failed to write material json to {}", path.display()))
}

/// Fill in scheme default params and ports for nodes that omit them.
pub fn normalize_document_defaults(doc: &mut MaterialDocument) -> Result<()> {
    let scheme = schema::load_default_scheme()?;
    for node in &mut doc.nodes {
        let Some(node_scheme) = scheme.nodes.get(&node.node_type) else {
            continue;
        };

        if !node_scheme.default_params.is_empty() {
            let mut merged = node_scheme.default_params.clone();
            for (k, v) in std::mem::take(&mut node.params) {
                merged.insert(k, v);
            }
            node.params = merged;
        }
        if node.inputs.is_empty() {
            node.inputs = node_scheme.input_ports();
        }
        if node.outputs.is_empty() {
            node.outputs = node_scheme.output_ports();
        }
    }
    Ok(())
}

pub fn incoming_connection<'a>(
    doc: &'a MaterialDocument,
    to_node_id: &str,
    to_port_id: &str,
) -> Option<&'a Connection> {
    doc.connections
        .iter()
        .find(|c| c.to.node_id == to_node_id && c.to.port_id == to_port_id)
}

pub fn parse_str<'a>(params: &'a HashMap<String, serde_json::Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}
