//! Locate the image backing a material's base color.
//!
//! The walk starts at the node linked into the principled surface's base-color input and
//! follows inputs backwards, depth-first, until it meets an image texture. Graph cycles are
//! legal; a node already on the current path simply ends that branch. A node whose subtree
//! came up empty is only walked again when reached at a shallower depth, which keeps shared
//! upstream nodes from being re-walked once per path.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::graph::{GraphQuery, NodeKind, ShaderNode};
use crate::temp_store::{TempStore, unique_file_stem};
use crate::transport::sniff_extension;

/// Nodes deeper than this (the first upstream node has depth 0) are never expanded.
pub const MAX_DEPTH: usize = 10;

const BASE_COLOR_NAMES: [&str; 3] = ["basecolor", "albedo", "diffusecolor"];
const PREFERRED_INPUTS: [&str; 5] = ["color", "image", "basecolor", "albedo", "diffuse"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub path: PathBuf,
    pub image_id: String,
    pub node_id: String,
    /// True when the path is a temp file materialized from packed data.
    pub materialized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    NoSurfaceNode,
    BaseColorUnlinked,
    NoImageReachable,
    ImageUnresolvable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(ResolvedImage),
    NotFound(MissReason),
}

impl Resolution {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Resolution::Found(img) => Some(&img.path),
            Resolution::NotFound(_) => None,
        }
    }
}

fn normalize_socket_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Resolve the base-color image of `graph`.
///
/// Packed images are written into `temp`; that is the only side effect.
pub fn resolve_base_texture(graph: &dyn GraphQuery, temp: &TempStore) -> Result<Resolution> {
    let Some(surface) = graph
        .node_ids()
        .iter()
        .filter_map(|id| graph.node(id))
        .find(|n| n.kind == NodeKind::PrincipledSurface)
    else {
        debug!("no principled surface node in graph");
        return Ok(Resolution::NotFound(MissReason::NoSurfaceNode));
    };

    let Some(start) = surface
        .inputs
        .iter()
        .find(|s| BASE_COLOR_NAMES.contains(&normalize_socket_name(&s.name).as_str()))
        .and_then(|s| graph.link_source(&surface.id, &s.name))
    else {
        debug!(node = %surface.id, "base color input is not linked");
        return Ok(Resolution::NotFound(MissReason::BaseColorUnlinked));
    };

    let mut walk = Walk {
        graph,
        on_path: HashSet::new(),
        exhausted: HashMap::new(),
    };
    let Some(image_node) = walk.find_image_node(&start, 0) else {
        debug!(start = %start, "no image texture reachable within depth bound");
        return Ok(Resolution::NotFound(MissReason::NoImageReachable));
    };

    match image_path(graph, &image_node, temp)? {
        Some(resolved) => {
            debug!(path = %resolved.path.display(), node = %resolved.node_id, "resolved base texture");
            Ok(Resolution::Found(resolved))
        }
        None => Ok(Resolution::NotFound(MissReason::ImageUnresolvable)),
    }
}

struct Walk<'a> {
    graph: &'a dyn GraphQuery,
    on_path: HashSet<String>,
    /// Shallowest depth at which a node was fully explored without finding an image.
    exhausted: HashMap<String, usize>,
}

impl Walk<'_> {
    fn find_image_node(&mut self, node_id: &str, depth: usize) -> Option<ShaderNode> {
        if depth > MAX_DEPTH {
            return None;
        }
        if self.exhausted.get(node_id).is_some_and(|&seen| seen <= depth) {
            return None;
        }
        if !self.on_path.insert(node_id.to_string()) {
            return None;
        }
        let graph = self.graph;
        let found = graph.node(node_id).and_then(|node| {
            if node.kind == NodeKind::ImageSource {
                return Some(node);
            }
            candidate_inputs(&node)
                .into_iter()
                .filter_map(|input| graph.link_source(&node.id, &input))
                .find_map(|upstream| self.find_image_node(&upstream, depth + 1))
        });
        self.on_path.remove(node_id);
        if found.is_none() {
            self.exhausted.insert(node_id.to_string(), depth);
        }
        found
    }
}

/// Inputs worth following from `node`, most promising first.
fn candidate_inputs(node: &ShaderNode) -> Vec<String> {
    if node.kind == NodeKind::Mix {
        return node
            .inputs
            .iter()
            .filter(|s| s.socket_type.carries_color())
            .take(2)
            .map(|s| s.name.clone())
            .collect();
    }

    let mut out: Vec<String> = Vec::new();
    for wanted in PREFERRED_INPUTS {
        if let Some(s) = node
            .inputs
            .iter()
            .find(|s| normalize_socket_name(&s.name) == wanted)
        {
            if !out.contains(&s.name) {
                out.push(s.name.clone());
            }
        }
    }
    for s in &node.inputs {
        if s.socket_type.carries_color() && !out.contains(&s.name) {
            out.push(s.name.clone());
        }
    }
    out
}

fn image_path(
    graph: &dyn GraphQuery,
    node: &ShaderNode,
    temp: &TempStore,
) -> Result<Option<ResolvedImage>> {
    let Some(image_id) = node.image.as_deref() else {
        debug!(node = %node.id, "image texture has no image assigned");
        return Ok(None);
    };
    let Some(info) = graph.image_info(image_id) else {
        debug!(node = %node.id, image = image_id, "image texture references a missing image");
        return Ok(None);
    };

    if let Some(raw) = info.filepath.as_deref() {
        match absolute_image_path(raw, graph.document_dir().as_deref()) {
            Some(path) if path.is_file() => {
                return Ok(Some(ResolvedImage {
                    path,
                    image_id: info.id,
                    node_id: node.id.clone(),
                    materialized: false,
                }));
            }
            Some(path) => {
                debug!(path = %path.display(), "image file does not exist");
            }
            None => {
                debug!(path = raw, "relative image path but host document was never saved");
            }
        }
    }

    if !info.has_packed_data {
        return Ok(None);
    }
    let bytes = graph.packed_bytes(&info.id)?;
    let file_name = format!(
        "{}.{}",
        unique_file_stem("packed", &info.id),
        sniff_extension(&bytes)
    );
    let path = temp
        .write(&file_name, &bytes)
        .with_context(|| format!("failed to materialize packed image '{}'", info.name))?;
    Ok(Some(ResolvedImage {
        path,
        image_id: info.id,
        node_id: node.id.clone(),
        materialized: true,
    }))
}

/// Absolute path for an image filepath; `None` if it is relative and there is no base dir.
fn absolute_image_path(raw: &str, document_dir: Option<&Path>) -> Option<PathBuf> {
    let (rel, forced_relative) = match raw.strip_prefix("//") {
        Some(rest) => (rest, true),
        None => (raw, false),
    };
    let p = PathBuf::from(rel);
    if p.is_absolute() && !forced_relative {
        return Some(p);
    }
    document_dir.map(|dir| dir.join(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Socket, SocketType};

    fn shader_node(id: &str, kind: NodeKind, inputs: &[(&str, SocketType)]) -> ShaderNode {
        ShaderNode {
            id: id.to_string(),
            kind,
            inputs: inputs
                .iter()
                .map(|(n, t)| Socket {
                    name: n.to_string(),
                    socket_type: *t,
                })
                .collect(),
            outputs: Vec::new(),
            image: None,
        }
    }

    #[test]
    fn mix_prefers_first_two_color_inputs() {
        let node = shader_node(
            "m",
            NodeKind::Mix,
            &[
                ("Fac", SocketType::Float),
                ("Color1", SocketType::Color),
                ("Color2", SocketType::Color),
            ],
        );
        assert_eq!(candidate_inputs(&node), vec!["Color1", "Color2"]);
    }

    #[test]
    fn generic_orders_named_inputs_before_others() {
        let node = shader_node(
            "g",
            NodeKind::Generic,
            &[
                ("Vector", SocketType::Vector),
                ("Fac", SocketType::Float),
                ("Albedo", SocketType::Color),
                ("Color", SocketType::Color),
                ("Tint", SocketType::Color),
            ],
        );
        assert_eq!(
            candidate_inputs(&node),
            vec!["Color", "Albedo", "Vector", "Tint"]
        );
    }

    #[test]
    fn relative_paths_need_a_document_dir() {
        let dir = Path::new("/proj");
        assert_eq!(
            absolute_image_path("//tex/wood.png", Some(dir)),
            Some(PathBuf::from("/proj/tex/wood.png"))
        );
        assert_eq!(
            absolute_image_path("tex/wood.png", Some(dir)),
            Some(PathBuf::from("/proj/tex/wood.png"))
        );
        assert_eq!(absolute_image_path("tex/wood.png", None), None);
        assert_eq!(
            absolute_image_path("/abs/wood.png", None),
            Some(PathBuf::from("/abs/wood.png"))
        );
    }

    #[test]
    fn socket_names_normalize() {
        assert_eq!(normalize_socket_name("Base Color"), "basecolor");
        assert_eq!(normalize_socket_name("base_color"), "basecolor");
    }
}
