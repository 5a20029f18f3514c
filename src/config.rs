use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Mesh used for every sprite instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpriteGeometryKind {
    #[default]
    Quad,
    Tri,
}

impl SpriteGeometryKind {
    pub fn from_label(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "quad" => Some(SpriteGeometryKind::Quad),
            "tri" | "triangle" => Some(SpriteGeometryKind::Tri),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SpriteGeometryKind::Quad => "quad",
            SpriteGeometryKind::Tri => "tri",
        }
    }
}

/// How dirty instruction records reach the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstructionUploadPolicy {
    /// Re-upload the whole instruction texture.
    Full,
    /// Re-upload only the grid rows covering the dirty instance range.
    #[default]
    DirtyRows,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpriteMeshConfig {
    #[serde(default = "SpriteMeshConfig::default_fps")]
    pub fps: f32,
    #[serde(default)]
    pub geometry: SpriteGeometryKind,
    #[serde(default)]
    pub billboarding: bool,
    #[serde(default)]
    pub instance_upload: InstructionUploadPolicy,
    #[serde(default = "SpriteMeshConfig::default_max_delta")]
    pub max_delta: f32,
}

#[derive(Debug, Clone, Default)]
pub struct SpriteMeshConfigOverrides {
    pub fps: Option<f32>,
    pub geometry: Option<SpriteGeometryKind>,
    pub billboarding: Option<bool>,
}

impl SpriteMeshConfig {
    const fn default_fps() -> f32 {
        15.0
    }

    const fn default_max_delta() -> f32 {
        0.25
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("[config] load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &SpriteMeshConfigOverrides) {
        if let Some(fps) = overrides.fps {
            self.fps = fps;
        }
        if let Some(geometry) = overrides.geometry {
            self.geometry = geometry;
        }
        if let Some(billboarding) = overrides.billboarding {
            self.billboarding = billboarding;
        }
    }
}

impl Default for SpriteMeshConfig {
    fn default() -> Self {
        Self {
            fps: Self::default_fps(),
            geometry: SpriteGeometryKind::default(),
            billboarding: false,
            instance_upload: InstructionUploadPolicy::default(),
            max_delta: Self::default_max_delta(),
        }
    }
}

impl SpriteMeshConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.fps.is_none() && self.geometry.is_none() && self.billboarding.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.fps.is_some() {
            fields.push("fps");
        }
        if self.geometry.is_some() {
            fields.push("geometry");
        }
        if self.billboarding.is_some() {
            fields.push("billboarding");
        }
        fields
    }
}
