use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use tokio::fs;

const READ_FILE_DEFAULT_MAX_BYTES: usize = 200_000;
const READ_FILE_HARD_MAX_BYTES: usize = 2_000_000;
const LIST_FILES_DEFAULT_MAX_ENTRIES: usize = 500;
const LIST_FILES_HARD_MAX_ENTRIES: usize = 5_000;

fn absolute(path: &str) -> Result<PathBuf> {
    let p = Path::new(path);
    if p.is_absolute() {
        Ok(p.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(p))
    }
}

pub async fn read_file(args: Value) -> Result<Value> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing required param: path"))?;
    let max_bytes = args
        .get("maxBytes")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(READ_FILE_DEFAULT_MAX_BYTES)
        .min(READ_FILE_HARD_MAX_BYTES);

    let abs = absolute(path)?;
    let bytes = fs::read(&abs).await.map_err(|e| anyhow!("FileNotFound: {e}"))?;
    let truncated = bytes.len() > max_bytes;
    let slice = if truncated { &bytes[..max_bytes] } else { &bytes[..] };

    Ok(json!({
        "path": abs.to_string_lossy(),
        "content": String::from_utf8_lossy(slice),
        "truncated": truncated,
    }))
}

pub async fn write_file(args: Value) -> Result<Value> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing required param: path"))?;
    let content = args
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing required param: content"))?;
    let create_if_missing = args
        .get("createIfMissing")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let abs = absolute(path)?;
    if !create_if_missing && !abs.exists() {
        bail!("FileNotFound: {}", abs.display());
    }
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(&abs, content).await?;

    Ok(json!({ "path": abs.to_string_lossy(), "bytesWritten": content.len() }))
}

struct Patch {
    start_line: usize,
    end_line: usize,
    new_text: String,
}

fn parse_patches(args: &Value) -> Result<Vec<Patch>> {
    let raw = args
        .get("patches")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("missing required param: patches"))?;
    if raw.is_empty() {
        bail!("patches must contain at least one entry");
    }

    let mut patches = Vec::with_capacity(raw.len());
    for p in raw {
        let start_line = p
            .get("startLine")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("patch.startLine must be a positive integer"))? as usize;
        let end_line = p
            .get("endLine")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("patch.endLine must be a positive integer"))? as usize;
        let new_text = p
            .get("newText")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("patch.newText must be a string"))?
            .to_string();
        if start_line == 0 || end_line < start_line {
            bail!("InvalidRange: startLine/endLine out of order");
        }
        patches.push(Patch { start_line, end_line, new_text });
    }
    Ok(patches)
}

/// Each patch replaces the 1-based, inclusive line range `[startLine,
/// endLine]` with `newText.split('\n')`. Patches are applied in descending
/// `startLine` order so earlier patches' indexes stay valid while later
/// (higher-numbered) patches are applied first.
pub async fn edit_file(args: Value) -> Result<Value> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing required param: path"))?;
    let mut patches = parse_patches(&args)?;
    patches.sort_by(|a, b| b.start_line.cmp(&a.start_line));

    let abs = absolute(path)?;
    let original = fs::read_to_string(&abs).await.map_err(|e| anyhow!("FileNotFound: {e}"))?;
    let mut lines: Vec<String> = original.split('\n').map(|s| s.to_string()).collect();
    // A trailing '\n' in the file produces a spurious empty last element from
    // split — drop it so line numbers match what an editor would show, then
    // restore the trailing newline on write.
    let had_trailing_newline = lines.last().map(|s| s.is_empty()).unwrap_or(false);
    if had_trailing_newline {
        lines.pop();
    }

    for patch in &patches {
        if patch.end_line > lines.len() {
            bail!(
                "InvalidRange: patch [{}, {}] out of bounds for {} lines",
                patch.start_line,
                patch.end_line,
                lines.len()
            );
        }
        let start_idx = patch.start_line - 1;
        let end_idx = patch.end_line;
        let replacement: Vec<String> = patch.new_text.split('\n').map(|s| s.to_string()).collect();
        lines.splice(start_idx..end_idx, replacement);
    }

    let mut new_content = lines.join("\n");
    if had_trailing_newline {
        new_content.push('\n');
    }
    fs::write(&abs, &new_content).await?;

    Ok(json!({ "applied": true, "hunksApplied": patches.len() }))
}

fn entry_json(path: &Path, is_dir: bool, size: Option<u64>) -> Value {
    json!({
        "path": path.to_string_lossy(),
        "type": if is_dir { "dir" } else { "file" },
        "size": size,
    })
}

/// Breadth-first so a `maxEntries` cutoff yields an even cross-section of
/// the tree rather than exhausting the first subdirectory encountered.
pub async fn list_files(args: Value) -> Result<Value> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing required param: path"))?;
    let recursive = args.get("recursive").and_then(Value::as_bool).unwrap_or(false);
    let max_entries = args
        .get("maxEntries")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(LIST_FILES_DEFAULT_MAX_ENTRIES)
        .min(LIST_FILES_HARD_MAX_ENTRIES);

    let root = absolute(path)?;
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(root);
    let mut entries = Vec::new();

    while let Some(dir) = queue.pop_front() {
        if entries.len() >= max_entries {
            break;
        }
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(r) => r,
            Err(_) => continue,
        };
        while let Some(entry) = read_dir.next_entry().await? {
            if entries.len() >= max_entries {
                break;
            }
            let file_type = entry.file_type().await?;
            let entry_path = entry.path();
            if file_type.is_dir() {
                entries.push(entry_json(&entry_path, true, None));
                if recursive {
                    queue.push_back(entry_path);
                }
            } else {
                let size = entry.metadata().await.ok().map(|m| m.len());
                entries.push(entry_json(&entry_path, false, size));
            }
        }
    }

    Ok(json!(entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn edit_file_replaces_single_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "a\nb\nc\n").await.unwrap();

        let result = edit_file(json!({
            "path": path.to_str().unwrap(),
            "patches": [{"startLine": 2, "endLine": 2, "newText": "B"}],
        }))
        .await
        .unwrap();

        assert_eq!(result["applied"], true);
        assert_eq!(result["hunksApplied"], 1);
        assert_eq!(fs::read_to_string(&path).await.unwrap(), "a\nB\nc\n");
    }

    #[tokio::test]
    async fn edit_file_applies_multiple_patches_back_to_front() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "1\n2\n3\n4\n5\n").await.unwrap();

        edit_file(json!({
            "path": path.to_str().unwrap(),
            "patches": [
                {"startLine": 1, "endLine": 2, "newText": "ONE"},
                {"startLine": 4, "endLine": 5, "newText": "FOUR"},
            ],
        }))
        .await
        .unwrap();

        assert_eq!(fs::read_to_string(&path).await.unwrap(), "ONE\n3\nFOUR\n");
    }

    #[tokio::test]
    async fn edit_file_rejects_out_of_bounds_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "a\nb\n").await.unwrap();

        let err = edit_file(json!({
            "path": path.to_str().unwrap(),
            "patches": [{"startLine": 10, "endLine": 11, "newText": "x"}],
        }))
        .await
        .unwrap_err();

        assert!(err.to_string().contains("InvalidRange"));
    }

    #[tokio::test]
    async fn write_file_respects_create_if_missing_false() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.txt");

        let err = write_file(json!({
            "path": path.to_str().unwrap(),
            "content": "hi",
            "createIfMissing": false,
        }))
        .await
        .unwrap_err();

        assert!(err.to_string().contains("FileNotFound"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn read_file_truncates_past_max_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        fs::write(&path, "0123456789").await.unwrap();

        let result = read_file(json!({"path": path.to_str().unwrap(), "maxBytes": 4})).await.unwrap();
        assert_eq!(result["content"], "0123");
        assert_eq!(result["truncated"], true);
    }

    #[tokio::test]
    async fn list_files_stops_at_max_entries() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("f{i}.txt")), "x").await.unwrap();
        }

        let result = list_files(json!({"path": dir.path().to_str().unwrap(), "maxEntries": 2})).await.unwrap();
        assert_eq!(result.as_array().unwrap().len(), 2);
    }
}
