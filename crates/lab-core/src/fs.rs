use chrono::Utc;
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Replaces `path` as a whole: the bytes go to a sibling temp file which is
/// synced and renamed over the target, so readers never see a partial write.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Two-space indented JSON with a trailing newline.
pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
}

/// Loads a JSON object from `path`. A missing file is `Ok(None)`; unreadable
/// content, malformed JSON, or a non-object document is an error.
pub fn read_json_object(path: &Path) -> Result<Option<Map<String, Value>>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice::<Value>(&raw)? {
        Value::Object(map) => Ok(Some(map)),
        _ => Err(Error::NotAnObject(path.display().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "lab_core_fs_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let root = temp_root("atomic");
        let path = root.join("nested").join("info.json");
        atomic_write_json_pretty(&path, &json!({"a": 1})).expect("write");
        atomic_write_json_pretty(&path, &json!({"a": 2})).expect("overwrite");

        let names: Vec<String> = fs::read_dir(path.parent().unwrap())
            .expect("list")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["info.json".to_string()]);
        let loaded = read_json_object(&path).expect("read").expect("present");
        assert_eq!(loaded.get("a"), Some(&json!(2)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn pretty_output_uses_two_space_indent() {
        let root = temp_root("indent");
        let path = root.join("out.json");
        atomic_write_json_pretty(&path, &json!({"key": {"inner": true}})).expect("write");
        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("\n  \"key\": {\n    \"inner\": true"), "{}", text);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn read_json_object_distinguishes_missing_and_malformed() {
        let root = temp_root("read");
        assert!(read_json_object(&root.join("absent.json"))
            .expect("missing is ok")
            .is_none());

        let bad = root.join("bad.json");
        fs::write(&bad, b"{ not json").expect("write");
        assert!(matches!(read_json_object(&bad), Err(Error::Json(_))));

        let list = root.join("list.json");
        fs::write(&list, b"[1, 2]").expect("write");
        assert!(matches!(read_json_object(&list), Err(Error::NotAnObject(_))));
        let _ = fs::remove_dir_all(root);
    }
}
