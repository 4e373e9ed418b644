//! Hand-off to the external knitout → DAT compiler (a Node script).

use std::path::Path;
use std::process::{Command, Stdio};

/// Run `node <compiler_script> <knitout> <dat>`.
///
/// Returns `false` when node is missing or the compiler exits non-zero;
/// the failure is logged, never raised.
pub fn knitout_to_dat(knitout: &Path, dat: &Path, compiler_script: &Path) -> bool {
    if !compiler_script.exists() {
        tracing::warn!(
            script = %compiler_script.display(),
            "DAT compiler script not found"
        );
        return false;
    }
    let output = Command::new("node")
        .arg(compiler_script)
        .arg(knitout)
        .arg(dat)
        .stdin(Stdio::null())
        .output();
    match output {
        Ok(out) if out.status.success() => {
            tracing::info!(path = %dat.display(), "wrote DAT");
            true
        }
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            for line in stderr.lines() {
                tracing::warn!("[knitout-to-dat] {line}");
            }
            tracing::warn!(status = %out.status, "DAT compiler failed");
            false
        }
        Err(e) => {
            tracing::warn!("could not launch node: {e}");
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_compiler_script_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ok = knitout_to_dat(
            &dir.path().join("a.k"),
            &dir.path().join("a.dat"),
            &dir.path().join("absent.js"),
        );
        assert!(!ok);
        assert!(!dir.path().join("a.dat").exists());
    }
}
