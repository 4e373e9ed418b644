//! Centralized file names and path-building helpers.
//!
//! No other module should hard-code these strings.

use std::path::{Path, PathBuf};

// ── Leaf filenames ───────────────────────────────────────────────

pub const ERROR_FILE: &str = "error.k";
pub const SETTINGS_FILE: &str = "knitscript.json";
pub const DEFAULT_DAT_COMPILER: &str = "knitout-to-dat.js";

// ── Extensions ───────────────────────────────────────────────────

pub const KNITSCRIPT_EXT: &str = "ks";
pub const KNITOUT_EXT: &str = "k";
pub const DAT_EXT: &str = "dat";

// ── Path functions ───────────────────────────────────────────────

/// The error file is written next to the requested output file.
pub fn error_path(out_path: &Path, error_file: &str) -> PathBuf {
    match out_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(error_file),
        _ => PathBuf::from(error_file),
    }
}

pub fn dat_path_for(knitout_path: &Path) -> PathBuf {
    knitout_path.with_extension(DAT_EXT)
}

pub fn knitout_path_for(pattern_path: &Path) -> PathBuf {
    pattern_path.with_extension(KNITOUT_EXT)
}

/// Candidate files for `import a.b.c`: `a/b/c.ks` under each search directory.
pub fn module_candidates(search_dirs: &[PathBuf], dotted: &[String]) -> Vec<PathBuf> {
    let mut relative = PathBuf::new();
    for part in dotted {
        relative.push(part);
    }
    relative.set_extension(KNITSCRIPT_EXT);
    search_dirs.iter().map(|dir| dir.join(&relative)).collect()
}
