//! Locating the ONNX Runtime shared library and preloading the GPU runtime
//! libraries it links against.
//!
//! [`setup_runtime_libs`] must run at the start of `main()`, before ORT is
//! touched: the loader caches its search path at startup, so libraries found
//! later are loaded by absolute path instead.

use std::collections::HashSet;
use std::env;
#[cfg(windows)]
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Name prefixes of libraries to preload, by load tier (CUDA, cuDNN, TensorRT).
#[cfg(unix)]
const PRELOAD_TIERS: [&[&str]; 3] = [
    &["libcudart", "libcublaslt", "libcublas", "libcufft", "libcurand"],
    &["libcudnn"],
    &["libnvinfer", "libnvonnxparser"],
];
#[cfg(windows)]
const PRELOAD_TIERS: [&[&str]; 3] = [
    &["cudart64_", "cublas64_", "cublaslt64_"],
    &["cudnn64_"],
    &["nvinfer", "nvonnxparser"],
];

/// What [`setup_runtime_libs`] found, for logging once tracing is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibReport {
    pub searched: Vec<PathBuf>,
    /// Set when the ORT library was found by the search rather than the environment.
    pub ort_dylib: Option<PathBuf>,
    pub preloaded: Vec<PathBuf>,
}

/// Directories probed, in order: `<exe>/lib`, `<exe>/../lib`, `<cwd>/lib`,
/// then the system library dirs on Unix. Windows also probes `<exe>` itself.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    dirs.extend([PathBuf::from("/usr/local/lib"), PathBuf::from("/usr/lib")]);
    dirs
}

fn find_ort_dylib(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load tier of a GPU runtime library; `None` for anything not preloaded,
/// including ORT's own provider libraries, which need ORT loaded first.
fn load_tier(file_name: &str) -> Option<usize> {
    let name = file_name.to_ascii_lowercase();
    PRELOAD_TIERS
        .iter()
        .position(|prefixes| prefixes.iter().any(|prefix| name.starts_with(prefix)))
}

#[cfg(unix)]
fn is_shared_library(path: &Path) -> bool {
    let named = path
        .file_name()
        .is_some_and(|name| name.to_string_lossy().contains(".so"));
    named && !path.is_symlink()
}

#[cfg(windows)]
fn is_shared_library(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// Libraries to preload in dependency order. The first directory holding a
/// given file name wins.
fn preload_plan(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut libs: Vec<(usize, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for path in entries.flatten().map(|entry| entry.path()) {
            if !is_shared_library(&path) {
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let Some(tier) = load_tier(&name) else {
                continue;
            };
            if seen.insert(name.clone()) {
                libs.push((tier, name, path));
            }
        }
    }

    libs.sort();
    libs.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
fn load_library(path: &Path) -> bool {
    // SAFETY: only known CUDA/cuDNN/TensorRT libraries reach here; their
    // initializers have no preconditions on our side.
    let opened = unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    };
    opened.map(std::mem::forget).is_ok()
}

#[cfg(windows)]
fn load_library(path: &Path) -> bool {
    // SAFETY: as on Unix.
    let opened = unsafe { libloading::Library::new(path) };
    opened.map(std::mem::forget).is_ok()
}

#[cfg(windows)]
fn prepend_to_path(dirs: &[PathBuf]) {
    let current = env::var_os("PATH");
    let mut seen = HashSet::new();
    let mut merged: Vec<PathBuf> = Vec::new();
    let existing = current
        .as_ref()
        .map(|path| env::split_paths(path).collect::<Vec<_>>())
        .unwrap_or_default();
    for dir in dirs.iter().filter(|d| d.is_dir()).cloned().chain(existing) {
        let key = dir.to_string_lossy().replace('/', "\\").to_ascii_lowercase();
        if !dir.as_os_str().is_empty() && seen.insert(key) {
            merged.push(dir);
        }
    }
    let joined = env::join_paths(merged).unwrap_or_else(|_| current.unwrap_or_else(OsString::new));
    env::set_var("PATH", joined);
}

/// Point ORT at a bundled runtime and preload the GPU libraries.
pub fn setup_runtime_libs() -> RuntimeLibReport {
    let searched = candidate_lib_dirs();
    let mut report = RuntimeLibReport::default();

    if env::var_os(ORT_DYLIB_ENV).is_none() {
        if let Some(path) = find_ort_dylib(&searched) {
            env::set_var(ORT_DYLIB_ENV, &path);
            report.ort_dylib = Some(path);
        }
        #[cfg(windows)]
        prepend_to_path(&searched);
    }

    report.preloaded = preload_plan(&searched)
        .into_iter()
        .filter(|path| load_library(path))
        .collect();
    report.searched = searched;
    report
}

/// Call after tracing is initialized.
pub fn log_runtime_lib_status(report: &RuntimeLibReport) {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => info!(path = %ort, "ORT library"),
        Ok(ort) => warn!(path = %ort, "{ORT_DYLIB_ENV} points at a missing file"),
        Err(_) => warn!(
            searched = report.searched.len(),
            "{ORT_DYLIB_ENV} not set; ORT will use its default search paths"
        ),
    }
    for lib in &report.preloaded {
        debug!(path = %lib.display(), "Preloaded GPU runtime library");
    }
}
