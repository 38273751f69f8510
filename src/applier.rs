//! Wire generated maps into a freshly rebuilt material graph.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::data_url::decode_base64_payload;
use crate::graph::{ColorSpace, GraphMutation};
use crate::protocol::{GenerationResult, MapKind, MapSelection};
use crate::temp_store::TempStore;
use crate::transport::sniff_extension;

const OUTPUT_X: f32 = 400.0;
const SURFACE_X: f32 = 0.0;
const IMAGE_X: f32 = -400.0;
const CONVERTER_X: f32 = -200.0;
const ROW_STEP: f32 = 200.0;

/// Kinds in the order their rows are laid out; AO sits next to albedo.
const LAYOUT_ORDER: [MapKind; 4] = [
    MapKind::Ao,
    MapKind::Metallic,
    MapKind::Roughness,
    MapKind::Normal,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyWarning {
    /// `None` for the albedo (base image) binding.
    pub kind: Option<MapKind>,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub applied: BTreeSet<MapKind>,
    pub albedo_bound: bool,
    pub warnings: Vec<ApplyWarning>,
}

impl ApplyReport {
    fn warn(&mut self, kind: Option<MapKind>, message: String) {
        warn!(kind = kind.map(MapKind::as_str).unwrap_or("albedo"), %message, "map not applied");
        self.warnings.push(ApplyWarning { kind, message });
    }
}

/// Decode every returned map into a temp file. Runs before any graph mutation.
pub fn decode_maps(
    result: &GenerationResult,
    temp: &TempStore,
) -> (BTreeMap<MapKind, PathBuf>, Vec<ApplyWarning>) {
    let mut files = BTreeMap::new();
    let mut warnings = Vec::new();
    for (&kind, data_url) in &result.textures {
        let written = decode_base64_payload(data_url).and_then(|bytes| {
            let name = format!("map_{kind}.{}", sniff_extension(&bytes));
            temp.write(&name, &bytes)
        });
        match written {
            Ok(path) => {
                debug!(%kind, path = %path.display(), "decoded map");
                files.insert(kind, path);
            }
            Err(e) => {
                warn!(%kind, error = %format!("{e:#}"), "failed to decode map");
                warnings.push(ApplyWarning {
                    kind: Some(kind),
                    message: format!("Failed to decode {} map: {e:#}", kind.label()),
                });
            }
        }
    }
    (files, warnings)
}

/// Replace the material graph with output, principled surface, albedo and every returned map.
///
/// Only the skeleton (output and surface nodes) is fatal; each map binds independently and
/// its failure lands in the report.
pub fn apply_maps(
    graph: &mut dyn GraphMutation,
    base_image: Option<&Path>,
    result: &GenerationResult,
    requested: &MapSelection,
    temp: &TempStore,
) -> Result<ApplyReport> {
    let (decoded, decode_warnings) = decode_maps(result, temp);
    let mut report = ApplyReport {
        warnings: decode_warnings,
        ..ApplyReport::default()
    };
    for kind in requested.iter().filter(|k| !result.textures.contains_key(k)) {
        debug!(%kind, "requested map not returned by the service");
    }

    graph.clear();
    let output = graph
        .add_node("MaterialOutput", None, [OUTPUT_X, 0.0])
        .context("failed to create material output")?;
    let surface = graph
        .add_node("PrincipledBsdf", None, [SURFACE_X, 0.0])
        .context("failed to create principled surface")?;
    graph
        .link(&surface, "BSDF", &output, "Surface")
        .context("failed to link surface to output")?;

    let albedo = match base_image {
        Some(path) => match bind_albedo(graph, path, &surface) {
            Ok(node) => Some(node),
            Err(e) => {
                report.warn(None, format!("Failed to load base image as albedo: {e:#}"));
                None
            }
        },
        None => None,
    };
    report.albedo_bound = albedo.is_some();

    let mut y = -ROW_STEP;
    for kind in LAYOUT_ORDER {
        let Some(path) = decoded.get(&kind) else {
            continue;
        };
        let bound = bind_map(graph, kind, path, y, &surface, albedo.as_deref());
        match bound {
            Ok(()) => {
                report.applied.insert(kind);
                y -= ROW_STEP;
            }
            Err(e) => report.warn(
                Some(kind),
                format!("Failed to load {} map: {e:#}", kind.label()),
            ),
        }
    }

    info!(
        applied = ?report.applied.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
        albedo = report.albedo_bound,
        warnings = report.warnings.len(),
        "material rebuilt"
    );
    Ok(report)
}

/// Load first, then create: a file that fails to load leaves no node behind.
fn image_node(
    graph: &mut dyn GraphMutation,
    path: &Path,
    label: &str,
    color_space: ColorSpace,
    y: f32,
) -> Result<String> {
    let image = graph.load_image(path, label, color_space)?;
    let node = graph.add_node("ImageTexture", Some(label), [IMAGE_X, y])?;
    graph.assign_image(&node, &image)?;
    Ok(node)
}

fn bind_albedo(graph: &mut dyn GraphMutation, path: &Path, surface: &str) -> Result<String> {
    let node = image_node(graph, path, "Albedo", ColorSpace::Srgb, 0.0)?;
    graph.link(&node, "Color", surface, "Base Color")?;
    Ok(node)
}

fn bind_map(
    graph: &mut dyn GraphMutation,
    kind: MapKind,
    path: &Path,
    y: f32,
    surface: &str,
    albedo: Option<&str>,
) -> Result<()> {
    let node = image_node(graph, path, kind.label(), ColorSpace::NonColor, y)?;
    match kind {
        MapKind::Ao => match albedo {
            Some(albedo) => {
                let mix = graph.add_node("MixRGB", None, [CONVERTER_X, y])?;
                graph.set_param(&mix, "blendType", json!("MULTIPLY"))?;
                graph.set_input_default(&mix, "Fac", json!(1.0))?;
                graph.link(albedo, "Color", &mix, "Color1")?;
                graph.link(&node, "Color", &mix, "Color2")?;
                graph.link(&mix, "Color", surface, "Base Color")?;
            }
            None => graph.link(&node, "Color", surface, "Base Color")?,
        },
        MapKind::Metallic => graph.link(&node, "Color", surface, "Metallic")?,
        MapKind::Roughness => graph.link(&node, "Color", surface, "Roughness")?,
        MapKind::Normal => {
            let normal = graph.add_node("NormalMap", None, [CONVERTER_X, y])?;
            graph.link(&node, "Color", &normal, "Color")?;
            graph.link(&normal, "Normal", surface, "Normal")?;
        }
    }
    Ok(())
}
