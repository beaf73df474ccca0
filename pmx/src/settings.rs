use std::path::Path;

use serde::Deserialize;

use crate::{ExportError, Format, Result};

/// Which attributes keep two corners of the same source vertex apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SeparationFlags {
    pub normals: bool,
    pub uvs: bool,
    pub colors: bool,
}
impl Default for SeparationFlags {
    fn default() -> Self {
        SeparationFlags { normals: false, uvs: true, colors: false }
    }
}

/// Everything an export pass needs to know, passed by reference into every entry point.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub format: Format,
    /// uniform factor applied to every position while writing
    pub scale: f32,
    pub separate: SeparationFlags,
    pub output_ik_end_nodes: bool,
    pub export_hidden_objects: bool,
    pub ik_iterations: u16,
    pub ik_control_weight: f32,
    pub tip_suffix: String,
    pub ik_suffix: String,
    pub model_name: String,
    pub model_comment: String,
    pub english_name: String,
    pub english_comment: String,
    pub toon_textures: [String; 10],
}

impl Default for ExportSettings {
    fn default() -> Self {
        ExportSettings {
            format: Format::default(),
            scale: 1.0,
            separate: SeparationFlags::default(),
            output_ik_end_nodes: true,
            export_hidden_objects: false,
            ik_iterations: 40,
            ik_control_weight: 0.5,
            tip_suffix: "先".into(),
            ik_suffix: "IK".into(),
            model_name: String::new(),
            model_comment: String::new(),
            english_name: String::new(),
            english_comment: String::new(),
            toon_textures: std::array::from_fn(|i| format!("toon{:02}.bmp", i + 1)),
        }
    }
}

impl ExportSettings {
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: ExportSettings = toml::from_str(text).map_err(|err| ExportError::Config(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        log::debug!("loading export settings from {}", path.as_ref().display());
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(ExportError::Config(format!("scale must be a positive number, got {}", self.scale)));
        }
        if !(0.0..=1.0e3).contains(&self.ik_control_weight) {
            return Err(ExportError::Config(format!("ik_control_weight out of range: {}", self.ik_control_weight)));
        }
        Ok(())
    }
}
