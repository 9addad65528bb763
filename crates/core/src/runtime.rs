//! GPU runtime library discovery, run before ORT or tracing come up.
//!
//! The ORT crate dlopens `libonnxruntime` at first use, and the CUDA/TRT
//! execution providers then dlopen their own runtime libraries. glibc
//! snapshots `LD_LIBRARY_PATH` at process start, so pointing it at our lib
//! directory from inside `main` does nothing; instead the ORT dylib path is
//! exported through `ORT_DYLIB_PATH` and the GPU runtimes are mapped into
//! the process directly, with absolute paths, before anything needs them.

use std::env;
#[cfg(windows)]
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// What [`setup_runtime_libs`] found. Produced before tracing exists, so
/// the harness logs it afterwards via [`RuntimeLibReport::log`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibReport {
    pub ort_dylib: Option<PathBuf>,
    pub preloaded_gpu_libs: usize,
}

impl RuntimeLibReport {
    pub fn log(&self) {
        match &self.ort_dylib {
            Some(path) if path.is_file() => info!(ort = %path.display(), "ORT library resolved"),
            Some(path) => warn!(
                ort = %path.display(),
                "ORT_DYLIB_PATH points at a missing file"
            ),
            None => warn!("ORT_DYLIB_PATH not set, ORT will use its default search paths"),
        }
        info!(count = self.preloaded_gpu_libs, "GPU runtime libraries preloaded");
    }
}

/// Exports `ORT_DYLIB_PATH` (unless the operator already set it) and maps
/// the GPU runtime libraries into the process. Call first thing in `main`.
pub fn setup_runtime_libs() -> RuntimeLibReport {
    let search_dirs = library_search_dirs();

    let ort_dylib = match env::var_os("ORT_DYLIB_PATH") {
        Some(existing) => Some(PathBuf::from(existing)),
        None => {
            let found = locate_ort_dylib(&search_dirs);
            if let Some(path) = &found {
                env::set_var("ORT_DYLIB_PATH", path);
            }
            #[cfg(windows)]
            widen_dll_search_path(&search_dirs);
            found
        }
    };

    RuntimeLibReport {
        ort_dylib,
        preloaded_gpu_libs: preload_gpu_libs(&search_dirs),
    }
}

/// Directories probed for runtime libraries, most specific first:
/// the executable's own `lib` (and the executable's directory on Windows),
/// the install prefix's `lib`, `<cwd>/lib`, then the system lib dirs on
/// Unix. First hit per file name wins.
fn library_search_dirs() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(exe_dir) = env::current_exe()
        .and_then(|exe| exe.canonicalize())
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        #[cfg(windows)]
        push(exe_dir.clone());
        push(exe_dir.join("lib"));
        if let Some(prefix) = exe_dir.parent() {
            push(prefix.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn locate_ort_dylib(search_dirs: &[PathBuf]) -> Option<PathBuf> {
    search_dirs
        .iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load tier for the GPU runtimes, `None` for everything else. The ORT
/// provider libraries themselves stay unloaded: they import symbols from
/// `libonnxruntime`, which the ORT crate maps later.
///
/// Tier 0 is the CUDA runtime, tier 1 cuDNN, tier 2 TensorRT; lower tiers
/// load first so transitive dependencies are already resident.
#[cfg(unix)]
fn gpu_lib_tier(file_name: &str) -> Option<u8> {
    let name = file_name.to_ascii_lowercase();
    const CUDA_RUNTIME: [&str; 5] = [
        "libcudart",
        "libcublaslt",
        "libcublas",
        "libcufft",
        "libcurand",
    ];
    if CUDA_RUNTIME.iter().any(|prefix| name.starts_with(prefix)) {
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
fn gpu_lib_tier(file_name: &str) -> Option<u8> {
    let name = file_name.to_ascii_lowercase();
    const CUDA_RUNTIME: [&str; 3] = ["cudart64_", "cublas64_", "cublaslt64_"];
    if CUDA_RUNTIME.iter().any(|prefix| name.starts_with(prefix)) {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_shared_library(file_name: &str, path: &Path) -> bool {
    file_name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_shared_library(_file_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// Maps every recognized GPU runtime library into the process, tier by
/// tier, and returns how many were loaded. Duplicate file names across
/// directories resolve to the first directory that has them.
fn preload_gpu_libs(search_dirs: &[PathBuf]) -> usize {
    use std::collections::BTreeMap;

    // (tier, file name) -> path; the BTreeMap ordering doubles as the
    // load order.
    let mut plan: BTreeMap<(u8, String), PathBuf> = BTreeMap::new();
    for dir in search_dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string())
            else {
                continue;
            };
            if !is_shared_library(&file_name, &path) {
                continue;
            }
            let Some(tier) = gpu_lib_tier(&file_name) else {
                continue;
            };
            plan.entry((tier, file_name)).or_insert(path);
        }
    }

    let count = plan.len();
    for path in plan.values() {
        unsafe { load_resident(path) };
    }
    count
}

/// The handle is leaked on purpose: these libraries must stay mapped for
/// the life of the process.
#[cfg(unix)]
unsafe fn load_resident(path: &Path) {
    if let Ok(lib) =
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    {
        std::mem::forget(lib);
    }
}

#[cfg(windows)]
unsafe fn load_resident(path: &Path) {
    if let Ok(lib) = libloading::Library::new(path) {
        std::mem::forget(lib);
    }
}

#[cfg(windows)]
fn widen_dll_search_path(search_dirs: &[PathBuf]) {
    let merged = prepend_to_path(env::var_os("PATH"), search_dirs);
    env::set_var("PATH", merged);
}

/// Puts the existing candidate directories in front of `PATH`, dropping
/// duplicates case-insensitively the way Windows path lookup does.
#[cfg(windows)]
fn prepend_to_path(current: Option<OsString>, search_dirs: &[PathBuf]) -> OsString {
    use std::collections::HashSet;

    let key_of = |dir: &Path| {
        dir.to_string_lossy()
            .replace('/', "\\")
            .to_ascii_lowercase()
    };

    let fallback = current.clone().unwrap_or_default();
    let mut seen = HashSet::<String>::new();
    let mut merged: Vec<PathBuf> = search_dirs
        .iter()
        .filter(|dir| dir.is_dir() && seen.insert(key_of(dir)))
        .cloned()
        .collect();
    if let Some(path) = current {
        merged.extend(
            env::split_paths(&path)
                .filter(|dir| !dir.as_os_str().is_empty() && seen.insert(key_of(dir))),
        );
    }
    env::join_paths(merged).unwrap_or(fallback)
}
