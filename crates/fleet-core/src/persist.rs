//! Atomic JSON state files.
//!
//! Writers serialize into a temp file in the target's directory and rename
//! it over the target, so readers polling the file never observe a torn write.

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
///
/// The resulting file is world-readable (0644 on unix) so external health
/// checks can poll it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');
    write_atomic(path, &body)
}

/// Atomically replace `path` with `body` (temp file + rename, mode 0644).
pub fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile_in(dir, path)?;
    tmp.file.write_all(body)?;
    tmp.file.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp.path, std::fs::Permissions::from_mode(0o644))?;
    }

    std::fs::rename(&tmp.path, path)?;
    Ok(())
}

/// Read a JSON state file. Returns `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

struct TempFile {
    path: std::path::PathBuf,
    file: std::fs::File,
}

fn tempfile_in(dir: &Path, target: &Path) -> Result<TempFile> {
    let stem = target
        .file_name()
        .map_or_else(|| "state".into(), |n| n.to_string_lossy().into_owned());
    let path = dir.join(format!(".{stem}.{}.tmp", std::process::id()));
    let file = std::fs::File::create(&path)?;
    Ok(TempFile { path, file })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let value: Option<BTreeMap<String, Vec<String>>> =
            read_json(&dir.path().join("absent.json")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn write_replaces_previous_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut state = BTreeMap::new();
        state.insert("rule-a".to_string(), vec!["agent-1".to_string()]);
        write_json_atomic(&path, &state).unwrap();

        state.insert("rule-b".to_string(), vec![]);
        write_json_atomic(&path, &state).unwrap();

        let loaded: BTreeMap<String, Vec<String>> = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, state);

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn state_file_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.json");
        write_json_atomic(&path, &serde_json::json!({"pid": 1})).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
