//! Execution provider selection and ONNX Runtime session construction.
//!
//! [`build_session`] registers the requested provider (with CUDA fallback for
//! TensorRT) and caches TensorRT engines per model under the configured cache
//! directory.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

/// Inference backend selection.
///
/// `Tensorrt` needs the TensorRT runtime (`libnvinfer.so.10` or `nvinfer.dll`);
/// without it ORT falls back to the CUDA provider registered after it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BackendConfig {
    pub backend: InferenceBackend,
    pub device_id: i32,
    pub trt_cache_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                stats.file_count += 1;
                stats.total_bytes += meta.len();
            }
        }
    }

    stats
}

/// Hex SHA-256 of a model file, streamed.
pub fn model_hash(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Format: `{model_hash[..16]}_{precision}`
pub fn trt_cache_key(model_hash: &str, fp16: bool) -> String {
    let short = &model_hash[..model_hash.len().min(16)];
    format!("{short}_{}", if fp16 { "fp16" } else { "fp32" })
}

pub fn resolve_trt_cache_dir(base_dir: &Path, cache_key: Option<&str>) -> PathBuf {
    match cache_key {
        Some(key) => base_dir.join(key),
        None => base_dir.to_path_buf(),
    }
}

/// Build an `ort::Session` for `model_path` with the configured provider.
pub fn build_session(model_path: &Path, config: &BackendConfig) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let base = config
                .trt_cache_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("trt_cache"));
            let key = match model_hash(model_path) {
                Ok(hash) => Some(trt_cache_key(&hash, true)),
                Err(e) => {
                    warn!(error = %e, "Cannot hash model; sharing the TensorRT cache root");
                    None
                }
            };
            let cache_dir = resolve_trt_cache_dir(&base, key.as_deref());

            if let Err(e) = fs::create_dir_all(&cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let cache_path = cache_dir.to_string_lossy().to_string();
            let before = cache_stats(&cache_dir);
            let started = Instant::now();
            info!(
                cache_dir = %cache_dir.display(),
                cache_files = before.file_count,
                cache_bytes = before.total_bytes,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let (stop_tx, stop_rx) = channel::<()>();
            let progress_thread = thread::spawn(move || {
                let tick = Duration::from_secs(15);
                let mut elapsed = 15_u64;
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            info!(
                                elapsed_secs = elapsed,
                                "TensorRT session initialization still in progress"
                            );
                            elapsed += 15;
                        }
                    }
                }
            });

            let session_result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(config.device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                ])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()));

            let _ = stop_tx.send(());
            let _ = progress_thread.join();

            let elapsed = started.elapsed().as_secs_f64();
            match session_result {
                Ok(session) => {
                    let after = cache_stats(&cache_dir);
                    info!(
                        elapsed_secs = elapsed,
                        cache_updated = after.total_bytes != before.total_bytes,
                        cache_files = after.file_count,
                        "TensorRT session ready"
                    );
                    session
                }
                Err(e) => {
                    error!(elapsed_secs = elapsed, error = %e, "TensorRT session initialization failed");
                    return Err(e);
                }
            }
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default().with_device_id(config.device_id);
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available; inference will fall back to CPU");
            }

            debug!(backend = "cuda", device = config.device_id, "Building session with CUDA EP");
            builder
                .with_execution_providers([cuda.build()])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session on the default CPU provider");
            builder
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?
        }
    };

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str_lossy() {
        assert_eq!(InferenceBackend::from_str_lossy("CUDA"), InferenceBackend::Cuda);
        assert_eq!(InferenceBackend::from_str_lossy("TensorRT"), InferenceBackend::Tensorrt);
        assert_eq!(InferenceBackend::from_str_lossy("trt"), InferenceBackend::Tensorrt);
        assert_eq!(InferenceBackend::from_str_lossy("Cpu"), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::from_str_lossy("vulkan"), InferenceBackend::Cuda);
    }

    #[test]
    fn test_backend_display_matches_serde() {
        for backend in [
            InferenceBackend::Cuda,
            InferenceBackend::Tensorrt,
            InferenceBackend::Cpu,
        ] {
            let encoded = serde_json::to_string(&backend).unwrap();
            assert_eq!(encoded, format!("\"{backend}\""));
        }
    }

    #[test]
    fn test_model_hash_and_cache_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x4.onnx");
        fs::write(&path, b"abc").unwrap();
        let hash = model_hash(&path).unwrap();
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(trt_cache_key(&hash, true), "ba7816bf8f01cfea_fp16");
        assert_eq!(trt_cache_key("abc", false), "abc_fp32");
    }

    #[test]
    fn test_model_hash_missing_file() {
        assert!(model_hash(Path::new("/nonexistent/x4.onnx")).is_err());
    }

    #[test]
    fn test_resolve_trt_cache_dir() {
        let base = PathBuf::from("trt_cache");
        assert_eq!(
            resolve_trt_cache_dir(&base, Some("ba7816bf_fp16")),
            PathBuf::from("trt_cache/ba7816bf_fp16")
        );
        assert_eq!(resolve_trt_cache_dir(&base, None), base);
    }

    #[test]
    fn test_cache_stats_counts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("engine")).unwrap();
        fs::write(dir.path().join("a.bin"), [0u8; 10]).unwrap();
        fs::write(dir.path().join("engine/b.bin"), [0u8; 5]).unwrap();
        let stats = cache_stats(dir.path());
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_bytes, 15);
    }
}
