//! Crash-safe state file helpers
//!
//! State files (checkpoints, health snapshots) are replaced with a
//! write-temp, fsync, rename sequence. A reader therefore sees either the
//! previous complete file or the new complete file, never a torn write.

use crate::error::{HalcyonError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Suffix used for the temporary sibling file during an atomic write.
pub const TEMP_SUFFIX: &str = "tmp";

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Atomically replace `path` with `contents`.
///
/// The parent directory is created if needed. The temporary file lives next
/// to the target so the final rename never crosses a filesystem boundary.
pub fn write_atomic(path: impl AsRef<Path>, contents: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let wrap = |source: std::io::Error| HalcyonError::AtomicWrite {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(wrap)?;
    }

    let tmp = temp_path(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(wrap)?;
        file.write_all(contents).map_err(wrap)?;
        file.sync_all().map_err(wrap)?;
    }

    fs::rename(&tmp, path).map_err(wrap)?;

    // Persist the rename itself. Directories cannot be opened on every
    // platform, so a failure here is not fatal.
    #[cfg(unix)]
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Read and deserialize a JSON file, returning `None` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Option<T>> {
    let path = path.as_ref();
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Turn an arbitrary name into something safe to use as a file stem.
///
/// Alphanumerics, `-` and `_` pass through; everything else becomes `_`.
pub fn sanitize_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Marker {
        cursor: String,
    }

    #[test]
    fn test_write_then_read_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cp.json");

        write_json_atomic(&path, &Marker { cursor: "abc".into() }).unwrap();
        let back: Option<Marker> = read_json(&path).unwrap();

        assert_eq!(back, Some(Marker { cursor: "abc".into() }));
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_overwrite_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");

        write_atomic(&path, b"{\"cursor\":\"a-much-longer-value\"}").unwrap();
        write_json_atomic(&path, &Marker { cursor: "b".into() }).unwrap();

        let back: Marker = read_json(&path).unwrap().unwrap();
        assert_eq!(back.cursor, "b");
    }

    #[test]
    fn test_read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let back: Option<Marker> = read_json(dir.path().join("absent.json")).unwrap();
        assert!(back.is_none());
    }

    #[test]
    fn test_sanitize_file_stem() {
        assert_eq!(sanitize_file_stem("halcyon:alert"), "halcyon_alert");
        assert_eq!(sanitize_file_stem("device_extracted-keys"), "device_extracted-keys");
        assert_eq!(sanitize_file_stem("a/b c"), "a_b_c");
    }
}
