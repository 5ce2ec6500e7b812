use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::device::DeviceInfo;
use crate::kernels::ChannelOrder;
use crate::network::backend::{BackendConfig, InferenceBackend};
use crate::session::{SessionConfig, TtaSubmission};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "VKSR_DATA_DIR";
pub const DEFAULT_MODEL: &str = "models-DF2K";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub session: SessionSection,
    pub devices: DevicesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionSection {
    pub gpu_id: Option<u32>,
    pub tta_mode: bool,
    /// 0 picks a tile size from the device heap budget.
    pub tile_size: usize,
    pub model: String,
    pub scale: usize,
    /// Overrides the model's known context padding.
    pub prepadding: Option<usize>,
    pub backend: InferenceBackend,
    pub channel_order: ChannelOrder,
    pub allow_fp16_storage: bool,
    pub allow_int8_storage: bool,
    pub tta_submission: TtaSubmission,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DevicesConfig {
    /// Devices to expose; empty means a single default device.
    pub devices: Vec<DeviceInfo>,
    pub default_heap_budget_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_files: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            gpu_id: defaults.gpu_id,
            tta_mode: defaults.tta_mode,
            tile_size: defaults.tile_size,
            model: DEFAULT_MODEL.to_string(),
            scale: defaults.scale,
            prepadding: None,
            backend: InferenceBackend::default(),
            channel_order: defaults.channel_order,
            allow_fp16_storage: defaults.allow_fp16_storage,
            allow_int8_storage: defaults.allow_int8_storage,
            tta_submission: defaults.tta_submission,
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            default_heap_budget_mb: 4096,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { retention_files: 7 }
    }
}

impl SessionSection {
    /// Per-session settings once the model's prepadding is known.
    pub fn session_config(&self, prepadding: usize) -> SessionConfig {
        SessionConfig {
            gpu_id: self.gpu_id,
            tta_mode: self.tta_mode,
            scale: self.scale,
            tile_size: self.tile_size,
            prepadding,
            channel_order: self.channel_order,
            tta_submission: self.tta_submission,
            allow_fp16_storage: self.allow_fp16_storage,
            allow_int8_storage: self.allow_int8_storage,
        }
    }

    pub fn backend_config(&self, trt_cache_dir: PathBuf) -> Result<BackendConfig> {
        let gpu_id = self.gpu_id.unwrap_or(0);
        let device_id = i32::try_from(gpu_id)
            .with_context(|| format!("gpu_id {gpu_id} is out of range for the inference runtime"))?;
        Ok(BackendConfig {
            backend: self.backend,
            device_id,
            trt_cache_dir: Some(trt_cache_dir),
        })
    }
}

impl DevicesConfig {
    /// The configured list, or one default device.
    pub fn device_list(&self) -> Vec<DeviceInfo> {
        if !self.devices.is_empty() {
            return self.devices.clone();
        }
        vec![DeviceInfo {
            ordinal: 0,
            name: "default".to_string(),
            heap_budget_mb: self.default_heap_budget_mb,
        }]
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. VKSR_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and write a default config.toml if it has none.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.session.model, "models-DF2K");
        assert_eq!(cfg.session.scale, 4);
        assert_eq!(cfg.session.tile_size, 0);
        assert_eq!(cfg.session.prepadding, None);
        assert_eq!(cfg.session.backend, InferenceBackend::Cuda);
        assert!(cfg.devices.devices.is_empty());
        assert_eq!(cfg.logging.retention_files, 7);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.session.gpu_id = Some(1);
        original.session.channel_order = ChannelOrder::Bgr;
        original.devices.devices.push(DeviceInfo {
            ordinal: 1,
            name: "second".into(),
            heap_budget_mb: 800,
        });
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let decoded: AppConfig = toml::from_str(
            "[session]\ntta_mode = true\nbackend = \"tensorrt\"\ntta_submission = \"batched\"\n",
        )
        .expect("deserialize partial config");
        assert!(decoded.session.tta_mode);
        assert_eq!(decoded.session.backend, InferenceBackend::Tensorrt);
        assert_eq!(decoded.session.tta_submission, TtaSubmission::Batched);
        assert_eq!(decoded.session.scale, 4);
        assert_eq!(decoded.paths, PathsConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("temp dir");
        let loaded = AppConfig::load_from_path(&temp.path().join("config.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[session\n").expect("write config");
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config TOML"));
    }

    #[test]
    fn session_section_maps_to_session_config() {
        let mut section = SessionSection::default();
        section.tta_mode = true;
        section.tile_size = 64;
        let session = section.session_config(12);
        assert!(session.tta_mode);
        assert_eq!(session.tile_size, 64);
        assert_eq!(session.prepadding, 12);
        assert_eq!(session.scale, 4);

        let backend = section.backend_config(PathBuf::from("/cache")).unwrap();
        assert_eq!(backend.device_id, 0);
        assert_eq!(backend.trt_cache_dir, Some(PathBuf::from("/cache")));
    }

    #[test]
    fn backend_config_rejects_gpu_ids_beyond_i32() {
        let mut section = SessionSection::default();
        section.gpu_id = Some(3);
        assert_eq!(section.backend_config(PathBuf::from("/cache")).unwrap().device_id, 3);

        section.gpu_id = Some(u32::MAX);
        let err = section.backend_config(PathBuf::from("/cache")).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err:#}");
    }

    #[test]
    fn empty_device_list_yields_default_device() {
        let devices = DevicesConfig::default().device_list();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].heap_budget_mb, 4096);
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let cli_path = Path::new("/custom");
        let result = data_dir(Some(cli_path));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_var_then_default() {
        let old = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(val) = old {
            env::set_var(ENV_DATA_DIR, val);
        }

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().expect("temp dir");
        let dir = temp.path().join("data");
        initialize_data_dir(&dir).expect("initialize data dir");

        assert!(dir.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&dir.join("config.toml")).expect("reload");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("temp dir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[session]\nscale = 1\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_absolute_path_unchanged() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("/abs/path"));
        assert_eq!(result, PathBuf::from("/abs/path"));
    }

    #[test]
    fn resolve_relative_to_joins_relative_path() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("sub"));
        assert_eq!(result, PathBuf::from("/base/sub"));
    }
}
