//! Configuration system

pub use serde::{Deserialize, Serialize};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Image manager settings
///
/// The `disable_*` switches mask features the device reports, which is useful for
/// exercising fallback paths on hardware that would otherwise take the fast one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Application name reported to the Vulkan instance
    pub application_name: String,
    /// Enable the Khronos validation layer and debug messenger
    pub enable_validation: bool,
    /// Never import or export dmabufs
    pub disable_dmabuf: bool,
    /// Skip sync_file import for imported dmabufs
    pub disable_semaphore_import: bool,
    /// Reject multi-planar YUV imports
    pub disable_ycbcr: bool,
    /// Never hand out CPU mappings of upload images
    pub force_staging: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            application_name: "gpu_image".to_string(),
            enable_validation: cfg!(debug_assertions),
            disable_dmabuf: false,
            disable_semaphore_import: false,
            disable_ycbcr: false,
            force_staging: false,
        }
    }
}

impl Config for ImageConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_path(suffix: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("image{}", suffix));
        (dir, path.to_string_lossy().into_owned())
    }

    #[test]
    fn test_toml_round_trip() {
        let (_dir, path) = temp_path(".toml");
        let config = ImageConfig {
            application_name: "probe".to_string(),
            disable_ycbcr: true,
            ..ImageConfig::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(ImageConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_ron_round_trip() {
        let (_dir, path) = temp_path(".ron");
        let config = ImageConfig {
            force_staging: true,
            enable_validation: false,
            ..ImageConfig::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(ImageConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "disable_dmabuf = true").unwrap();

        let config = ImageConfig::load_from_file(file.path().to_str().unwrap()).unwrap();
        assert!(config.disable_dmabuf);
        assert_eq!(config.application_name, "gpu_image");
        assert!(!config.force_staging);
    }

    #[test]
    fn test_unsupported_extension() {
        let mut file = NamedTempFile::with_suffix(".ini").unwrap();
        writeln!(file, "disable_dmabuf = true").unwrap();

        let result = ImageConfig::load_from_file(file.path().to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_parse_error() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "disable_dmabuf = \"maybe\"").unwrap();

        let result = ImageConfig::load_from_file(file.path().to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
