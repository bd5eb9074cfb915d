use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

/// Represents a structured document on disk (the image catalog or a config
/// override). This mainly helps sort out the various supported formats.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DocumentPath {
    Json(PathBuf),
    Ron(PathBuf),
    Toml(PathBuf),
    Yaml(PathBuf),
}

impl DocumentPath {
    /// Determine the document format from the file extension. Anything
    /// unrecognized is assumed to be JSON.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();

        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("ron") => Self::Ron(path),
            Some("toml") => Self::Toml(path),
            Some("yaml") | Some("yml") => Self::Yaml(path),
            _ => Self::Json(path),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Json(path) | Self::Ron(path) | Self::Toml(path) | Self::Yaml(path) => path,
        }
    }

    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Read and deserialize the document.
    pub fn load<T: DeserializeOwned>(&self) -> Result<T> {
        let content = std::fs::read(self.path())
            .with_context(|| format!("Failed to read {}", self))?;

        Ok(match self {
            Self::Json(_) => serde_json::from_slice(&content)
                .with_context(|| format!("Invalid JSON in {}", self))?,
            Self::Ron(_) => {
                ron::de::from_bytes(&content).with_context(|| format!("Invalid RON in {}", self))?
            }
            Self::Toml(_) => toml::from_str(std::str::from_utf8(&content)?)
                .with_context(|| format!("Invalid TOML in {}", self))?,
            Self::Yaml(_) => serde_yaml::from_slice(&content)
                .with_context(|| format!("Invalid YAML in {}", self))?,
        })
    }
}

impl Display for DocumentPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.path().to_string_lossy().fmt(f)
    }
}
