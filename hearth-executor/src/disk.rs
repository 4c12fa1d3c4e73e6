//! VM disk images, installation media and per-VM file cleanup.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::DiskFormat;
use crate::OrchestratorError;

const GIB: u64 = 1024 * 1024 * 1024;

/// Creates a fresh disk image at `path`, replacing any existing file.
///
/// # Errors
/// Returns [`OrchestratorError::DiskAllocation`] if the directory cannot be
/// created, `qemu-img` fails, or the raw file cannot be sized.
pub async fn allocate(
    path: &Path,
    format: DiskFormat,
    size_gib: u64,
) -> Result<(), OrchestratorError> {
    let fail = |reason: String| OrchestratorError::DiskAllocation { path: path.to_owned(), reason };

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(|e| fail(e.to_string()))?;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "replaced existing disk image"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(fail(format!("remove stale image: {e}"))),
    }

    match format {
        DiskFormat::Qcow2 => {
            let output = Command::new("qemu-img")
                .arg("create")
                .arg("-f")
                .arg("qcow2")
                .arg(path)
                .arg(format!("{size_gib}G"))
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| fail(format!("exec qemu-img: {e}")))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(fail(format!(
                    "qemu-img exited with {}: {}",
                    output.status,
                    stderr.trim()
                )));
            }
        }
        DiskFormat::Raw => {
            let file = tokio::fs::File::create(path).await.map_err(|e| fail(e.to_string()))?;
            file.set_len(size_gib.saturating_mul(GIB))
                .await
                .map_err(|e| fail(e.to_string()))?;
        }
    }

    tracing::info!(
        path = %path.display(),
        format = format.as_str(),
        size_gib,
        "disk image allocated"
    );
    Ok(())
}

/// Resolves a catalog media path against `media_dir` and checks it exists.
///
/// # Errors
/// Returns [`OrchestratorError::MediaMissing`] if the resolved file is absent.
pub async fn resolve_media(
    media_dir: &Path,
    catalog_path: &Path,
) -> Result<PathBuf, OrchestratorError> {
    let path = if catalog_path.is_absolute() {
        catalog_path.to_owned()
    } else {
        media_dir.join(catalog_path)
    };
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Ok(path),
        _ => Err(OrchestratorError::MediaMissing { path }),
    }
}

/// Removes one file. A missing file is success; other errors are returned
/// as a message for the caller's cleanup report.
pub async fn remove_file(path: &Path) -> Result<bool, String> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(format!("remove {}: {e}", path.display())),
    }
}

/// Removes every regular file in `dir` whose name starts with `prefix`.
///
/// Returns the removed paths and the failures. A missing directory yields
/// nothing to remove. Matching is a literal prefix, so `alpha` also matches
/// `alphabet.qcow2`.
pub async fn remove_prefixed(dir: &Path, prefix: &str) -> (Vec<PathBuf>, Vec<String>) {
    let mut removed = Vec::new();
    let mut failures = Vec::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return (removed, failures),
        Err(e) => {
            failures.push(format!("read {}: {e}", dir.display()));
            return (removed, failures);
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                failures.push(format!("read {}: {e}", dir.display()));
                break;
            }
        };
        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }
        match entry.file_type().await {
            Ok(kind) if kind.is_file() => {}
            _ => continue,
        }
        let path = entry.path();
        match remove_file(&path).await {
            Ok(true) => removed.push(path),
            Ok(false) => {}
            Err(e) => failures.push(e),
        }
    }

    (removed, failures)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> tempfile::TempDir {
        match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => panic!("tempdir: {e}"),
        }
    }

    #[tokio::test]
    async fn allocate_raw_creates_sparse_file_of_requested_size() {
        let dir = temp_dir();
        let path = dir.path().join("vms").join("alpha.raw");
        assert!(allocate(&path, DiskFormat::Raw, 1).await.is_ok());
        let len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or_default();
        assert_eq!(len, GIB);
    }

    #[tokio::test]
    async fn allocate_replaces_existing_image() {
        let dir = temp_dir();
        let path = dir.path().join("alpha.raw");
        std::fs::write(&path, b"old contents").expect("seed file");
        assert!(allocate(&path, DiskFormat::Raw, 1).await.is_ok());
        let head = std::fs::read(&path).map(|b| b[..12].to_vec()).unwrap_or_default();
        assert_eq!(head, vec![0u8; 12], "old contents must be gone");
    }

    #[tokio::test]
    async fn resolve_media_joins_relative_paths() {
        let dir = temp_dir();
        std::fs::write(dir.path().join("linux.iso"), b"iso").expect("seed iso");
        let resolved = resolve_media(dir.path(), Path::new("linux.iso")).await;
        assert!(matches!(resolved, Ok(p) if p == dir.path().join("linux.iso")));
    }

    #[tokio::test]
    async fn resolve_media_reports_missing_file() {
        let dir = temp_dir();
        let resolved = resolve_media(dir.path(), Path::new("absent.iso")).await;
        assert!(matches!(resolved, Err(OrchestratorError::MediaMissing { .. })));
    }

    #[tokio::test]
    async fn remove_prefixed_only_touches_matching_files() {
        let dir = temp_dir();
        for name in ["alpha.qcow2", "alpha-7-1.qcow2", "beta.qcow2"] {
            std::fs::write(dir.path().join(name), b"x").expect("seed");
        }
        std::fs::create_dir(dir.path().join("alpha-dir")).expect("seed dir");

        let (removed, failures) = remove_prefixed(dir.path(), "alpha").await;
        assert!(failures.is_empty(), "unexpected failures: {failures:?}");
        assert_eq!(removed.len(), 2);
        assert!(dir.path().join("beta.qcow2").exists());
        assert!(dir.path().join("alpha-dir").exists(), "directories are left alone");
    }

    #[tokio::test]
    async fn remove_prefixed_on_missing_dir_is_empty() {
        let dir = temp_dir();
        let (removed, failures) = remove_prefixed(&dir.path().join("nope"), "alpha").await;
        assert!(removed.is_empty() && failures.is_empty());
    }
}
