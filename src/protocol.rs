//! Wire types for the GenPBR texture generation endpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::transport::TransportPayload;

pub const DEFAULT_ENDPOINT: &str = "https://genpbr.com/api/v1/generate-texture";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Map kinds the service can generate, in canonical request order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapKind {
    Normal,
    Metallic,
    Roughness,
    Ao,
}

impl MapKind {
    pub const ALL: [MapKind; 4] = [
        MapKind::Normal,
        MapKind::Metallic,
        MapKind::Roughness,
        MapKind::Ao,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MapKind::Normal => "normal",
            MapKind::Metallic => "metallic",
            MapKind::Roughness => "roughness",
            MapKind::Ao => "ao",
        }
    }

    /// Name given to the image resource and node label in the material.
    pub fn label(self) -> &'static str {
        match self {
            MapKind::Normal => "Normal Map",
            MapKind::Metallic => "Metallic",
            MapKind::Roughness => "Roughness",
            MapKind::Ao => "Ambient Occlusion",
        }
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MapKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(MapKind::Normal),
            "metallic" => Ok(MapKind::Metallic),
            "roughness" => Ok(MapKind::Roughness),
            "ao" | "ambient-occlusion" | "ambient_occlusion" => Ok(MapKind::Ao),
            other => Err(anyhow!(
                "unknown map kind '{other}' (supported: normal, metallic, roughness, ao)"
            )),
        }
    }
}

/// Ordered set of requested kinds; iteration is always in canonical order.
pub type MapSelection = BTreeSet<MapKind>;

/// Inclusive valid range for each option, as `(min, max)`.
pub const NORMAL_STRENGTH_RANGE: (f32, f32) = (0.0, 10.0);
pub const METALLIC_INTENSITY_RANGE: (f32, f32) = (0.0, 2.0);
pub const ROUGHNESS_INTENSITY_RANGE: (f32, f32) = (0.0, 5.0);
pub const AO_INTENSITY_RANGE: (f32, f32) = (0.0, 5.0);
pub const AO_RADIUS_RANGE: (f32, f32) = (1.0, 30.0);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationOptions {
    pub normal_strength: f32,
    pub metallic_intensity: f32,
    pub roughness_intensity: f32,
    pub ao_intensity: f32,
    pub ao_radius: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            normal_strength: 5.0,
            metallic_intensity: 0.8,
            roughness_intensity: 2.0,
            ao_intensity: 2.0,
            ao_radius: 12.0,
        }
    }
}

impl GenerationOptions {
    /// Each field forced into its valid range; non-finite values fall back to the default.
    pub fn clamped(&self) -> Self {
        let d = Self::default();
        let fit = |v: f32, (lo, hi): (f32, f32), dflt: f32| {
            if v.is_finite() { v.clamp(lo, hi) } else { dflt }
        };
        Self {
            normal_strength: fit(self.normal_strength, NORMAL_STRENGTH_RANGE, d.normal_strength),
            metallic_intensity: fit(
                self.metallic_intensity,
                METALLIC_INTENSITY_RANGE,
                d.metallic_intensity,
            ),
            roughness_intensity: fit(
                self.roughness_intensity,
                ROUGHNESS_INTENSITY_RANGE,
                d.roughness_intensity,
            ),
            ao_intensity: fit(self.ao_intensity, AO_INTENSITY_RANGE, d.ao_intensity),
            ao_radius: fit(self.ao_radius, AO_RADIUS_RANGE, d.ao_radius),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub payload: TransportPayload,
    pub kinds: MapSelection,
    pub options: GenerationOptions,
}

/// JSON body as sent to the service.
#[derive(Debug, Serialize)]
pub struct GenerateTextureBody {
    #[serde(rename = "baseImage")]
    pub base_image: String,
    #[serde(rename = "textureTypes")]
    pub texture_types: Vec<MapKind>,
    pub options: GenerationOptions,
}

impl GenerationRequest {
    pub fn to_body(&self) -> GenerateTextureBody {
        GenerateTextureBody {
            base_image: self.payload.to_data_url(),
            texture_types: self.kinds.iter().copied().collect(),
            options: self.options.clamped(),
        }
    }
}

/// Raw success/failure envelope; every field is optional so partial bodies still parse.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub textures: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub debug: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub usage: Option<serde_json::Value>,
}

impl ResponseEnvelope {
    pub fn message_text(&self) -> Option<String> {
        self.message.as_ref().map(value_text)
    }

    pub fn error_text(&self) -> Option<String> {
        self.error.as_ref().map(value_text)
    }
}

fn value_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Generated maps keyed by kind, each still an encoded data URL.
#[derive(Debug, Clone, Default)]
pub struct GenerationResult {
    pub textures: BTreeMap<MapKind, String>,
    pub metadata: Option<serde_json::Value>,
    pub usage: Option<serde_json::Value>,
}

impl GenerationResult {
    pub fn kinds(&self) -> MapSelection {
        self.textures.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> TransportPayload {
        TransportPayload {
            bytes: vec![0, 0, 0],
            mime_type: "image/png".to_string(),
            max_bytes: 1024,
            original_size: 3,
            recompressed: false,
        }
    }

    #[test]
    fn body_uses_wire_field_names_and_canonical_order() {
        let request = GenerationRequest {
            payload: payload(),
            kinds: [MapKind::Ao, MapKind::Normal, MapKind::Roughness]
                .into_iter()
                .collect(),
            options: GenerationOptions::default(),
        };
        let json = serde_json::to_value(request.to_body()).unwrap();
        assert_eq!(json["baseImage"], "data:image/png;base64,AAAA");
        assert_eq!(
            json["textureTypes"],
            serde_json::json!(["normal", "roughness", "ao"])
        );
        assert_eq!(json["options"]["normalStrength"], 5.0);
        assert_eq!(json["options"]["aoRadius"], 12.0);
        assert!(json["options"].get("metallicIntensity").is_some());
        assert!(json["options"].get("roughnessIntensity").is_some());
        assert!(json["options"].get("aoIntensity").is_some());
    }

    #[test]
    fn options_are_clamped_into_range() {
        let wild = GenerationOptions {
            normal_strength: 50.0,
            metallic_intensity: -1.0,
            roughness_intensity: f32::NAN,
            ao_intensity: 2.5,
            ao_radius: 0.0,
        };
        let c = wild.clamped();
        assert_eq!(c.normal_strength, 10.0);
        assert_eq!(c.metallic_intensity, 0.0);
        assert_eq!(c.roughness_intensity, 2.0);
        assert_eq!(c.ao_intensity, 2.5);
        assert_eq!(c.ao_radius, 1.0);
    }

    #[test]
    fn map_kind_parses_aliases() {
        assert_eq!("AO".parse::<MapKind>().unwrap(), MapKind::Ao);
        assert_eq!("ambient-occlusion".parse::<MapKind>().unwrap(), MapKind::Ao);
        assert!("height".parse::<MapKind>().is_err());
        assert_eq!(MapKind::ALL.map(MapKind::as_str), ["normal", "metallic", "roughness", "ao"]);
    }
}
