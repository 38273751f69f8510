//! User-facing generation settings, credential lookup and file picking.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::protocol::{GenerationOptions, MapKind, MapSelection};

pub const API_KEY_ENV: &str = "GENPBR_API_KEY";

pub const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationSettings {
    /// Empty means "detect from the material".
    pub base_texture_path: String,
    pub generate_normal: bool,
    pub generate_metallic: bool,
    pub generate_roughness: bool,
    pub generate_ao: bool,
    pub options: GenerationOptions,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            base_texture_path: String::new(),
            generate_normal: true,
            generate_metallic: true,
            generate_roughness: true,
            generate_ao: true,
            options: GenerationOptions::default(),
        }
    }
}

impl GenerationSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings at {}", path.display()))?;
        let settings: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse settings at {}", path.display()))?;
        Ok(settings.sanitized())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write settings to {}", path.display()))
    }

    pub fn base_texture(&self) -> Option<PathBuf> {
        let p = self.base_texture_path.trim();
        (!p.is_empty()).then(|| PathBuf::from(p))
    }

    pub fn selection(&self) -> MapSelection {
        let mut out = MapSelection::new();
        for (on, kind) in [
            (self.generate_normal, MapKind::Normal),
            (self.generate_metallic, MapKind::Metallic),
            (self.generate_roughness, MapKind::Roughness),
            (self.generate_ao, MapKind::Ao),
        ] {
            if on {
                out.insert(kind);
            }
        }
        out
    }

    pub fn set_selection(&mut self, selection: &MapSelection) {
        self.generate_normal = selection.contains(&MapKind::Normal);
        self.generate_metallic = selection.contains(&MapKind::Metallic);
        self.generate_roughness = selection.contains(&MapKind::Roughness);
        self.generate_ao = selection.contains(&MapKind::Ao);
    }

    /// Copy with every option inside its valid range; each adjustment is logged.
    pub fn sanitized(&self) -> Self {
        let clamped = self.options.clamped();
        let pairs = [
            ("normalStrength", self.options.normal_strength, clamped.normal_strength),
            ("metallicIntensity", self.options.metallic_intensity, clamped.metallic_intensity),
            ("roughnessIntensity", self.options.roughness_intensity, clamped.roughness_intensity),
            ("aoIntensity", self.options.ao_intensity, clamped.ao_intensity),
            ("aoRadius", self.options.ao_radius, clamped.ao_radius),
        ];
        for (name, before, after) in pairs {
            if before.to_bits() != after.to_bits() {
                warn!(option = name, value = before, used = after, "option out of range");
            }
        }
        Self {
            options: clamped,
            ..self.clone()
        }
    }
}

/// Parse `normal,metallic,...` into a selection. `all` selects every kind.
pub fn parse_map_list(s: &str) -> Result<MapSelection> {
    if s.trim().eq_ignore_ascii_case("all") {
        return Ok(MapKind::ALL.into_iter().collect());
    }
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::parse::<MapKind>)
        .collect()
}

pub trait CredentialStore: Send + Sync {
    /// Trimmed key, `None` when unset or blank.
    fn api_key(&self) -> Option<String>;
    fn set_api_key(&self, key: &str) -> Result<()>;
}

/// Reads the key from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvCredentialStore {
    var: String,
}

impl EnvCredentialStore {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new(API_KEY_ENV)
    }
}

impl CredentialStore for EnvCredentialStore {
    fn api_key(&self) -> Option<String> {
        let key = std::env::var(&self.var).ok()?;
        let key = key.trim();
        (!key.is_empty()).then(|| key.to_string())
    }

    fn set_api_key(&self, _key: &str) -> Result<()> {
        bail!("{} is read from the environment and cannot be changed here", self.var)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    key: Mutex<Option<String>>,
}

impl InMemoryCredentialStore {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Mutex::new(Some(key.into())),
        }
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn api_key(&self) -> Option<String> {
        let guard = self.key.lock().ok()?;
        let key = guard.as_deref()?.trim();
        (!key.is_empty()).then(|| key.to_string())
    }

    fn set_api_key(&self, key: &str) -> Result<()> {
        let mut guard = self
            .key
            .lock()
            .map_err(|_| anyhow!("credential store lock poisoned"))?;
        *guard = Some(key.trim().to_string());
        Ok(())
    }
}

pub trait FilePicker {
    fn pick_image(&self) -> Option<PathBuf>;
}

/// Native file dialog filtered to supported image types.
#[derive(Debug, Default, Clone, Copy)]
pub struct RfdFilePicker;

impl FilePicker for RfdFilePicker {
    fn pick_image(&self) -> Option<PathBuf> {
        rfd::FileDialog::new()
            .set_title("Select Base Texture")
            .add_filter("Images", &IMAGE_EXTENSIONS)
            .pick_file()
    }
}
