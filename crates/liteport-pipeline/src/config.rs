use std::path::{Component, Path, PathBuf};

use liteport_flat::Quantize;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML")]
    TomlParse(#[from] toml::de::Error),

    #[error("invalid pipeline config: {0}")]
    Validation(String),
}

/// What to do when the flat output already exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    #[default]
    Fail,
    Replace,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub intermediate: PathBuf,
    pub output: PathBuf,
    /// Resize size for layers saved without one.
    pub resize_size: usize,
    pub overwrite: OverwritePolicy,
    pub quantize: Quantize,
    pub keep_intermediate_on_failure: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("models/slim-net-157-0.02.ckpt"),
            intermediate: PathBuf::from("slim-net.intermediate"),
            output: PathBuf::from("models/slim-net.lpfb"),
            resize_size: 157,
            overwrite: OverwritePolicy::Fail,
            quantize: Quantize::None,
            keep_intermediate_on_failure: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    pipeline: PipelineConfig,
}

impl PipelineConfig {
    /// Parse the `[pipeline]` table; missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        Ok(file.pipeline)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let paths = [
            ("input", &self.input),
            ("intermediate", &self.intermediate),
            ("output", &self.output),
        ];
        for (role, path) in paths {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(format!("{role} path is empty")));
            }
        }
        let resolved = paths.map(|(role, path)| (role, path, resolve(path)));
        for (i, (a_role, a, a_resolved)) in resolved.iter().enumerate() {
            for (b_role, _, b_resolved) in &resolved[i + 1..] {
                if a_resolved == b_resolved {
                    return Err(ConfigError::Validation(format!(
                        "{a_role} and {b_role} are the same path ({})",
                        a.display()
                    )));
                }
            }
        }
        if self.resize_size == 0 {
            return Err(ConfigError::Validation(
                "resize_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Absolute form of `path` with `.` and `..` removed and the parent directory
/// canonicalized when it exists, so aliases of one file compare equal.
fn resolve(path: &Path) -> PathBuf {
    let absolute = match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    };
    let mut normal = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normal.pop();
            }
            other => normal.push(other),
        }
    }

    let canonical = |p: &Path| -> Option<PathBuf> {
        let name = p.file_name()?;
        let parent = p.parent()?.canonicalize().ok()?;
        Some(parent.join(name))
    };
    // the raw parent first: `link/..` means the symlink target's parent
    canonical(&absolute)
        .or_else(|| canonical(&normal))
        .unwrap_or(normal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_slim_net_layout() {
        let config = PipelineConfig::default();
        assert_eq!(config.input, PathBuf::from("models/slim-net-157-0.02.ckpt"));
        assert_eq!(config.resize_size, 157);
        assert_eq!(config.overwrite, OverwritePolicy::Fail);
        assert!(config.keep_intermediate_on_failure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_partial_pipeline_table() -> anyhow::Result<()> {
        let config = PipelineConfig::from_toml(
            r#"
            [pipeline]
            input = "ckpt/net.ckpt"
            output = "out/net.lpfb"
            overwrite = "replace"
            quantize = "int8-weights"
            keep_intermediate_on_failure = false
            "#,
        )?;
        assert_eq!(config.input, PathBuf::from("ckpt/net.ckpt"));
        assert_eq!(config.output, PathBuf::from("out/net.lpfb"));
        assert_eq!(config.intermediate, PathBuf::from("slim-net.intermediate"));
        assert_eq!(config.overwrite, OverwritePolicy::Replace);
        assert_eq!(config.quantize, Quantize::Int8Weights);
        assert!(!config.keep_intermediate_on_failure);
        Ok(())
    }

    #[test]
    fn empty_file_is_all_defaults() -> anyhow::Result<()> {
        assert_eq!(PipelineConfig::from_toml("")?, PipelineConfig::default());
        Ok(())
    }

    #[test]
    fn rejects_unknown_policy() {
        let err = PipelineConfig::from_toml("[pipeline]\noverwrite = \"sometimes\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(_)));
    }

    #[test]
    fn validation_catches_colliding_paths_and_zero_size() {
        let config = PipelineConfig {
            intermediate: PathBuf::from("models/slim-net.lpfb"),
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let config = PipelineConfig {
            resize_size: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let config = PipelineConfig {
            input: PathBuf::new(),
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn validation_sees_through_dot_dot_aliases() {
        let config = PipelineConfig {
            input: PathBuf::from("work/net.ckpt"),
            intermediate: PathBuf::from("work/sub/../net.ckpt"),
            output: PathBuf::from("./work/net.lpfb"),
            ..PipelineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("input and intermediate"), "{err}");

        let config = PipelineConfig {
            output: PathBuf::from("work/./net.ckpt"),
            intermediate: PathBuf::from("work/net.intermediate"),
            ..config
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("input and output"), "{err}");
    }

    #[test]
    fn missing_config_file_is_io_error() {
        let err = PipelineConfig::load(Path::new("/nonexistent/liteport.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
