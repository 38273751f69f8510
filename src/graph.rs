//! Narrow host-graph interfaces and their implementation over [`MaterialDocument`].
//!
//! The resolver only ever sees [`GraphQuery`]; the applier only ever sees
//! [`GraphMutation`]. Any host can be supported by implementing these two traits.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use base64::{Engine as _, engine::general_purpose};

use crate::dsl::{
    Connection, Endpoint, ImageData, MaterialDocument, Node, incoming_connection, parse_str,
};
use crate::schema::{self, NodeScheme};
use crate::temp_store::sanitize_file_stem;
use crate::transport::sniff_extension;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    ImageSource,
    Mix,
    PrincipledSurface,
    Generic,
}

impl NodeKind {
    pub fn from_node_type(node_type: &str) -> Self {
        match node_type {
            "ImageTexture" => NodeKind::ImageSource,
            "MixRGB" | "Mix" => NodeKind::Mix,
            "PrincipledBsdf" => NodeKind::PrincipledSurface,
            _ => NodeKind::Generic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Color,
    Vector,
    Float,
    Shader,
    Other,
}

impl SocketType {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "color" | "rgba" => SocketType::Color,
            "vector" | "vec3" => SocketType::Vector,
            "float" | "value" => SocketType::Float,
            "shader" => SocketType::Shader,
            _ => SocketType::Other,
        }
    }

    pub fn carries_color(self) -> bool {
        matches!(self, SocketType::Color | SocketType::Vector)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socket {
    pub name: String,
    pub socket_type: SocketType,
}

/// Read-only snapshot of one node, detached from the host's storage.
#[derive(Debug, Clone)]
pub struct ShaderNode {
    pub id: String,
    pub kind: NodeKind,
    pub inputs: Vec<Socket>,
    pub outputs: Vec<Socket>,
    /// Image datablock id for image-source nodes.
    pub image: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub id: String,
    pub name: String,
    pub filepath: Option<String>,
    pub has_packed_data: bool,
}

pub trait GraphQuery {
    /// Node ids in declaration order.
    fn node_ids(&self) -> Vec<String>;
    fn node(&self, id: &str) -> Option<ShaderNode>;
    /// Upstream node feeding `input` of `node_id`, if linked.
    fn link_source(&self, node_id: &str, input: &str) -> Option<String>;
    fn image_info(&self, image_id: &str) -> Option<ImageInfo>;
    fn packed_bytes(&self, image_id: &str) -> Result<Vec<u8>>;
    /// Directory of the saved host document, `None` if never saved.
    fn document_dir(&self) -> Option<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Srgb,
    NonColor,
}

impl ColorSpace {
    pub fn as_str(self) -> &'static str {
        match self {
            ColorSpace::Srgb => "sRGB",
            ColorSpace::NonColor => "Non-Color",
        }
    }
}

pub trait GraphMutation {
    /// Drop every node and link. Image datablocks survive, as in the host.
    fn clear(&mut self);
    fn add_node(&mut self, node_type: &str, label: Option<&str>, location: [f32; 2])
    -> Result<String>;
    /// Connect an output to an input, replacing whatever fed that input before.
    fn link(&mut self, from_node: &str, from_port: &str, to_node: &str, to_port: &str)
    -> Result<()>;
    fn set_param(&mut self, node_id: &str, key: &str, value: serde_json::Value) -> Result<()>;
    fn set_input_default(
        &mut self,
        node_id: &str,
        input: &str,
        value: serde_json::Value,
    ) -> Result<()>;
    /// Load an image file into the host's resources; returns the image id.
    fn load_image(&mut self, path: &Path, name: &str, color_space: ColorSpace) -> Result<String>;
    fn assign_image(&mut self, node_id: &str, image_id: &str) -> Result<()>;
}

fn sockets_of(scheme: &NodeScheme, node: &Node, output: bool) -> Vec<Socket> {
    let instance = if output { &node.outputs } else { &node.inputs };
    if !instance.is_empty() {
        return instance
            .iter()
            .map(|p| Socket {
                name: p.id.clone(),
                socket_type: SocketType::parse(p.port_type.as_deref().unwrap_or("")),
            })
            .collect();
    }
    let Some(node_scheme) = scheme.nodes.get(&node.node_type) else {
        return Vec::new();
    };
    let ports = if output {
        &node_scheme.outputs
    } else {
        &node_scheme.inputs
    };
    ports
        .iter()
        .map(|p| Socket {
            name: p.id.clone(),
            socket_type: SocketType::parse(&p.port_type),
        })
        .collect()
}

impl GraphQuery for MaterialDocument {
    fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    fn node(&self, id: &str) -> Option<ShaderNode> {
        let node = MaterialDocument::node(self, id)?;
        // The embedded scheme is compiled in; a parse failure would be a build defect.
        let scheme = schema::load_default_scheme().ok()?;
        Some(ShaderNode {
            id: node.id.clone(),
            kind: NodeKind::from_node_type(&node.node_type),
            inputs: sockets_of(scheme, node, false),
            outputs: sockets_of(scheme, node, true),
            image: parse_str(&node.params, "image").map(str::to_string),
        })
    }

    fn link_source(&self, node_id: &str, input: &str) -> Option<String> {
        incoming_connection(self, node_id, input).map(|c| c.from.node_id.clone())
    }

    fn image_info(&self, image_id: &str) -> Option<ImageInfo> {
        let img = self.images.get(image_id)?;
        Some(ImageInfo {
            id: image_id.to_string(),
            name: img.name.clone(),
            filepath: img.filepath.clone().filter(|p| !p.trim().is_empty()),
            has_packed_data: img.packed.as_deref().is_some_and(|s| !s.trim().is_empty()),
        })
    }

    fn packed_bytes(&self, image_id: &str) -> Result<Vec<u8>> {
        let img = self
            .images
            .get(image_id)
            .ok_or_else(|| anyhow!("image not found: {image_id}"))?;
        let packed = img
            .packed
            .as_deref()
            .ok_or_else(|| anyhow!("image '{image_id}' has no packed data"))?;
        general_purpose::STANDARD
            .decode(packed.trim())
            .with_context(|| format!("invalid packed data for image '{image_id}'"))
    }

    fn document_dir(&self) -> Option<PathBuf> {
        MaterialDocument::document_dir(self)
    }
}

fn unique_node_id(doc: &MaterialDocument, base: &str) -> String {
    if doc.node(base).is_none() {
        return base.to_string();
    }
    (1..)
        .map(|i| format!("{base}.{i:03}"))
        .find(|id| doc.node(id).is_none())
        .unwrap_or_else(|| base.to_string())
}

impl GraphMutation for MaterialDocument {
    fn clear(&mut self) {
        self.nodes.clear();
        self.connections.clear();
    }

    fn add_node(
        &mut self,
        node_type: &str,
        label: Option<&str>,
        location: [f32; 2],
    ) -> Result<String> {
        let scheme = schema::load_default_scheme()?;
        let Some(node_scheme) = scheme.nodes.get(node_type) else {
            bail!("unknown node type '{node_type}'");
        };
        let id = unique_node_id(self, node_type);
        self.nodes.push(Node {
            id: id.clone(),
            node_type: node_type.to_string(),
            label: label.map(str::to_string),
            location: Some(location),
            params: node_scheme.default_params.clone(),
            inputs: node_scheme.input_ports(),
            outputs: node_scheme.output_ports(),
        });
        Ok(id)
    }

    fn link(&mut self, from_node: &str, from_port: &str, to_node: &str, to_port: &str) -> Result<()> {
        let scheme = schema::load_default_scheme()?;
        let from = self
            .node(from_node)
            .ok_or_else(|| anyhow!("link source node not found: {from_node}"))?;
        let to = self
            .node(to_node)
            .ok_or_else(|| anyhow!("link target node not found: {to_node}"))?;
        let from_ty = schema::port_type(scheme, from, from_port, true)
            .ok_or_else(|| anyhow!("node '{from_node}' has no output '{from_port}'"))?;
        let to_ty = schema::port_type(scheme, to, to_port, false)
            .ok_or_else(|| anyhow!("node '{to_node}' has no input '{to_port}'"))?;
        if !schema::port_types_compatible(scheme, from_ty, to_ty) {
            bail!("cannot link {from_node}.{from_port} ({from_ty}) to {to_node}.{to_port} ({to_ty})");
        }

        self.connections
            .retain(|c| !(c.to.node_id == to_node && c.to.port_id == to_port));
        let id = (self.connections.len()..)
            .map(|i| format!("link_{i}"))
            .find(|id| self.connections.iter().all(|c| &c.id != id))
            .unwrap_or_default();
        self.connections.push(Connection {
            id,
            from: Endpoint {
                node_id: from_node.to_string(),
                port_id: from_port.to_string(),
            },
            to: Endpoint {
                node_id: to_node.to_string(),
                port_id: to_port.to_string(),
            },
        });
        Ok(())
    }

    fn set_param(&mut self, node_id: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.id == node_id)
            .ok_or_else(|| anyhow!("node not found: {node_id}"))?;
        node.params.insert(key.to_string(), value);
        Ok(())
    }

    fn set_input_default(
        &mut self,
        node_id: &str,
        input: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.id == node_id)
            .ok_or_else(|| anyhow!("node not found: {node_id}"))?;
        let port = node
            .inputs
            .iter_mut()
            .find(|p| p.id == input)
            .ok_or_else(|| anyhow!("node '{node_id}' has no input '{input}'"))?;
        port.default_value = Some(value);
        Ok(())
    }

    fn load_image(&mut self, path: &Path, name: &str, color_space: ColorSpace) -> Result<String> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read image at {}", path.display()))?;
        // Probe the header so an undecodable file never becomes an image resource.
        image::ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .context("failed to sniff image format")?
            .into_dimensions()
            .with_context(|| format!("failed to decode image at {}", path.display()))?;

        // Regenerating a map replaces the datablock of the same name.
        let id = sanitize_file_stem(name);
        self.images.insert(
            id.clone(),
            ImageData {
                name: name.to_string(),
                filepath: Some(path.display().to_string()),
                packed: Some(general_purpose::STANDARD.encode(&bytes)),
                color_space: color_space.as_str().to_string(),
            },
        );
        Ok(id)
    }

    fn assign_image(&mut self, node_id: &str, image_id: &str) -> Result<()> {
        if !self.images.contains_key(image_id) {
            bail!("image not found: {image_id}");
        }
        self.set_param(node_id, "image", serde_json::Value::String(image_id.to_string()))
    }
}

/// Write every packed image next to `dir` and point the datablocks at the files.
///
/// Returns the number of images written.
pub fn unpack_images(doc: &mut MaterialDocument, dir: &Path) -> Result<usize> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create unpack dir {}", dir.display()))?;
    let ids: Vec<String> = doc
        .images
        .iter()
        .filter(|(_, img)| img.packed.is_some())
        .map(|(id, _)| id.clone())
        .collect();

    for id in &ids {
        let bytes = doc.packed_bytes(id)?;
        let file_name = format!("{}.{}", sanitize_file_stem(id), sniff_extension(&bytes));
        let out = dir.join(file_name);
        std::fs::write(&out, &bytes)
            .with_context(|| format!("failed to write image {}", out.display()))?;
        if let Some(img) = doc.images.get_mut(id) {
            img.filepath = Some(out.display().to_string());
            img.packed = None;
        }
    }
    Ok(ids.len())
}
