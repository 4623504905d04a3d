//! Service configuration, read from a YAML file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::container::Codec;
use crate::formula::Limits;
use crate::registry::ConfigParseError;
use crate::transform::DEFAULT_SAMPLE_LIMIT;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Allow-list of builtin functions and types.
    pub builtins: PathBuf,
    /// Allow-list of importable modules.
    pub imports: PathBuf,
    /// Directory the container files of transform requests are resolved in.
    pub data_dir: PathBuf,
    /// Failure messages kept per calc column.
    pub sample_limit: usize,
    pub max_string_len: usize,
    pub max_list_len: usize,
    /// Compression of written containers.
    pub codec: Codec,
}

impl Default for Config {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            builtins: PathBuf::from("allowed_builtins.yaml"),
            imports: PathBuf::from("allowed_imports.yaml"),
            data_dir: PathBuf::from("."),
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            max_string_len: limits.max_string_len,
            max_list_len: limits.max_list_len,
            codec: Codec::default(),
        }
    }
}

impl Config {
    /// Parse configuration text. Relative paths stay relative.
    pub fn parse(origin: &str, text: &str) -> Result<Self, ConfigParseError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yml::from_str(text).map_err(|error| ConfigParseError::Config {
            origin: origin.to_string(),
            message: error.to_string(),
        })
    }

    /// Load from a file. A missing file yields the defaults. Relative paths in
    /// the file are taken relative to the directory of the file.
    pub fn load(path: &Path) -> Result<Self, ConfigParseError> {
        let origin = path.display().to_string();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                log::info!("no configuration at {origin}, using defaults");
                return Ok(Self::default());
            }
            Err(error) => return Err(ConfigParseError::Io { origin, error }),
        };

        let mut config = Self::parse(&origin, &text)?;
        if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            for path in [&mut config.builtins, &mut config.imports, &mut config.data_dir] {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        }
        log::debug!("configuration loaded from {origin}: {config:?}");
        Ok(config)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_string_len: self.max_string_len,
            max_list_len: self.max_list_len,
        }
    }
}
