use std::env;
#[cfg(windows)]
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::UpscaleError;

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Oldest ONNX Runtime API level the session code is written against.
pub const MIN_ORT_API_VERSION: u32 = 21;

/// Search directories relative to the current executable for runtime libraries.
///
/// Probes these locations in order:
///   1. `<exe_dir>/` (Windows only)
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/` (Unix only)
///   6. `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
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
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

/// First ORT library found in `dirs`. The plain name wins over versioned
/// siblings (`libonnxruntime.so.1.21.0`) within the same directory.
fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    for dir in dirs {
        let candidate = dir.join(ORT_LIB_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        let mut versioned: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.starts_with(&format!("{ORT_LIB_NAME}.")))
            })
            .collect();
        versioned.sort();
        if let Some(path) = versioned.pop() {
            return Some(path);
        }
    }
    None
}

/// Minor version encoded in an ORT library file name, if any.
///
/// `libonnxruntime.so.1.20.1` and `libonnxruntime.1.20.1.dylib` both yield
/// `20`. ORT's C API level tracks its minor release number.
pub fn ort_minor_version(file_name: &str) -> Option<u32> {
    let lower = file_name.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("libonnxruntime.so.")
        .or_else(|| {
            lower
                .strip_prefix("libonnxruntime.")
                .and_then(|r| r.strip_suffix(".dylib"))
        })?;
    let mut parts = rest.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    (major == 1).then_some(minor)
}

/// Reject an ORT library whose file name says it predates the required API.
///
/// Unversioned names are accepted; the loader reports the mismatch later if
/// the symbols are missing.
pub fn check_ort_api_version(dylib: &Path) -> Result<(), UpscaleError> {
    let Some(name) = dylib.file_name().and_then(|name| name.to_str()) else {
        return Ok(());
    };
    match ort_minor_version(name) {
        Some(found) if found < MIN_ORT_API_VERSION => {
            Err(UpscaleError::UnsupportedRuntimeVersion {
                required: MIN_ORT_API_VERSION,
                found,
            })
        }
        _ => Ok(()),
    }
}

/// Library ORT will load, as configured through `ORT_DYLIB_PATH`.
pub fn resolved_ort_dylib() -> Option<PathBuf> {
    env::var_os("ORT_DYLIB_PATH").map(PathBuf::from)
}

#[cfg(windows)]
fn normalize_windows_path_key(path: &Path) -> String {
    path.to_string_lossy()
        .replace('/', "\\")
        .to_ascii_lowercase()
}

#[cfg(windows)]
fn build_path_with_prepended_dirs(current: Option<OsString>, dirs: &[PathBuf]) -> OsString {
    use std::collections::HashSet;

    let fallback = current.clone().unwrap_or_default();
    let mut merged = Vec::new();
    let mut seen = HashSet::<String>::new();

    for dir in dirs.iter().filter(|dir| dir.is_dir()) {
        if seen.insert(normalize_windows_path_key(dir)) {
            merged.push(dir.clone());
        }
    }
    if let Some(path) = current {
        for dir in env::split_paths(&path) {
            if !dir.as_os_str().is_empty() && seen.insert(normalize_windows_path_key(&dir)) {
                merged.push(dir);
            }
        }
    }

    env::join_paths(merged).unwrap_or(fallback)
}

/// Load-priority tier for GPU runtime libs, or `None` for anything that must
/// not be preloaded. ORT provider libraries are excluded: they need symbols
/// from `libonnxruntime` itself, which `ort` loads later.
///
///   0: CUDA runtime (cudart, cublas, cublasLt, cufft, curand)
///   1: cuDNN
///   2: TensorRT (nvinfer, nvonnxparser)
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["libcudart", "libcublas", "libcufft", "libcurand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["cudart64_", "cublas64_", "cublaslt64_"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

/// Pre-load GPU runtime libraries by absolute path, CUDA before cuDNN before
/// TensorRT. glibc snapshots `LD_LIBRARY_PATH` at startup, so exporting it
/// from inside the process would not reach the provider's `dlopen`.
///
/// The first directory holding a given file name wins.
fn preload_libs_from_dirs(dirs: &[PathBuf]) {
    use std::collections::HashSet;

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            if !is_candidate_lib(&name, &path) || !seen_names.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    for (_, _, lib_path) in &libs {
        unsafe { load_library(lib_path) };
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

#[cfg(unix)]
unsafe fn load_library(path: &Path) {
    if let Ok(lib) =
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    {
        std::mem::forget(lib);
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) {
    if let Ok(lib) = libloading::Library::new(path) {
        std::mem::forget(lib);
    }
}

/// Point `ort` at a bundled ONNX Runtime and preload GPU libraries.
///
/// Call at the very start of `main()`, before any ORT or tracing init.
pub fn setup_runtime_libs() {
    let dirs = candidate_lib_dirs();

    if env::var_os("ORT_DYLIB_PATH").is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
            env::set_var("ORT_DYLIB_PATH", &path);
        }

        #[cfg(windows)]
        env::set_var(
            "PATH",
            build_path_with_prepended_dirs(env::var_os("PATH"), &dirs),
        );
    }

    preload_libs_from_dirs(&dirs);
}

/// Log the resolved ORT library. Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match resolved_ort_dylib() {
        Some(path) if path.is_file() => info!(path = %path.display(), "ONNX Runtime library"),
        Some(path) => warn!(
            path = %path.display(),
            "ORT_DYLIB_PATH points to a missing file"
        ),
        None => warn!("ORT_DYLIB_PATH not set, ONNX Runtime will use default search paths"),
    }
}
