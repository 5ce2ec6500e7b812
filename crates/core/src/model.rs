//! Model directories: locating graph/weights files and the per-model context
//! padding the tiling needs.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SrError};

/// A known model directory and the halo its receptive field needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub prepadding: usize,
    /// Scale factors shipped in the directory.
    pub scales: Vec<usize>,
    pub description: String,
}

fn builtin_catalog() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            name: "models-DF2K".into(),
            prepadding: 10,
            scales: vec![4],
            description: "Real-world SR trained on DF2K with estimated kernels and noise".into(),
        },
        ModelEntry {
            name: "models-DF2K_JPEG".into(),
            prepadding: 10,
            scales: vec![4],
            description: "DF2K variant trained with JPEG compression artifacts".into(),
        },
    ]
}

/// Graph and weight files for one scale of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub name: String,
    pub param: PathBuf,
    pub weights: PathBuf,
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: builtin_catalog(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    /// Model directory names present under the models dir, sorted.
    pub fn installed(&self) -> Vec<String> {
        let Ok(read_dir) = fs::read_dir(&self.models_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = read_dir
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    /// Context padding for `name`: the explicit override, else the catalog value.
    pub fn prepadding_for(&self, name: &str, configured: Option<usize>) -> Result<usize> {
        if let Some(prepadding) = configured {
            return Ok(prepadding);
        }
        self.get(model_key(name))
            .map(|entry| entry.prepadding)
            .ok_or_else(|| {
                SrError::unsupported(format!(
                    "no known prepadding for model {name}; set session.prepadding"
                ))
            })
    }

    /// Resolve `name_or_path` to the `x{scale}` graph and weights.
    ///
    /// The argument is tried as given, then under the models dir. The weights
    /// are `x{scale}.onnx.data` when present, otherwise the graph itself.
    pub fn resolve(&self, name_or_path: &str, scale: usize) -> Result<ModelFiles> {
        let given = PathBuf::from(name_or_path);
        let dir = if given.is_dir() {
            given
        } else {
            self.models_dir.join(name_or_path)
        };

        let param = dir.join(format!("x{scale}.onnx"));
        if !param.is_file() {
            return Err(SrError::load(
                &param,
                format!("model {name_or_path} has no {scale}x graph"),
            ));
        }
        let external = dir.join(format!("x{scale}.onnx.data"));
        let weights = if external.is_file() {
            external
        } else {
            param.clone()
        };

        debug!(param = %param.display(), weights = %weights.display(), "Resolved model files");
        Ok(ModelFiles {
            name: model_key(name_or_path).to_string(),
            param,
            weights,
        })
    }
}

/// Last path component, so `models/models-DF2K/` and `models-DF2K` agree.
fn model_key(name_or_path: &str) -> &str {
    Path::new(name_or_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name_or_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(dirs: &[(&str, &[&str])]) -> (tempfile::TempDir, ModelRegistry) {
        let root = tempfile::tempdir().unwrap();
        for (dir, files) in dirs {
            let path = root.path().join(dir);
            fs::create_dir_all(&path).unwrap();
            for file in *files {
                fs::write(path.join(file), b"onnx").unwrap();
            }
        }
        let registry = ModelRegistry::with_builtin_models(root.path().to_path_buf());
        (root, registry)
    }

    #[test]
    fn test_builtin_catalog_prepadding() {
        let reg = ModelRegistry::with_builtin_models(PathBuf::from("models"));
        assert_eq!(reg.list().len(), 2);
        assert_eq!(reg.prepadding_for("models-DF2K", None).unwrap(), 10);
        assert_eq!(reg.prepadding_for("models/models-DF2K_JPEG", None).unwrap(), 10);
    }

    #[test]
    fn test_unknown_model_requires_explicit_prepadding() {
        let reg = ModelRegistry::with_builtin_models(PathBuf::from("models"));
        assert!(matches!(
            reg.prepadding_for("custom", None),
            Err(SrError::UnsupportedConfiguration(_))
        ));
        assert_eq!(reg.prepadding_for("custom", Some(7)).unwrap(), 7);
    }

    #[test]
    fn test_resolve_prefers_external_weights() {
        let (root, reg) = registry_with(&[("models-DF2K", &["x4.onnx", "x4.onnx.data"])]);
        let files = reg.resolve("models-DF2K", 4).unwrap();
        assert_eq!(files.param, root.path().join("models-DF2K/x4.onnx"));
        assert_eq!(files.weights, root.path().join("models-DF2K/x4.onnx.data"));
        assert_eq!(files.name, "models-DF2K");
    }

    #[test]
    fn test_resolve_embedded_weights_and_direct_path() {
        let (root, reg) = registry_with(&[("custom", &["x1.onnx"])]);
        let direct = root.path().join("custom");
        let files = reg.resolve(direct.to_str().unwrap(), 1).unwrap();
        assert_eq!(files.weights, files.param);
        assert_eq!(files.name, "custom");
    }

    #[test]
    fn test_resolve_missing_scale_is_load_error() {
        let (_root, reg) = registry_with(&[("models-DF2K", &["x4.onnx"])]);
        assert!(matches!(reg.resolve("models-DF2K", 2), Err(SrError::Load { .. })));
        assert!(matches!(reg.resolve("absent", 4), Err(SrError::Load { .. })));
    }

    #[test]
    fn test_installed_lists_directories_only() {
        let (root, reg) = registry_with(&[("b", &[]), ("a", &[])]);
        fs::write(root.path().join("stray.onnx"), b"x").unwrap();
        assert_eq!(reg.installed(), vec!["a".to_string(), "b".to_string()]);
    }
}
