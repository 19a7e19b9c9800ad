use std::path::Path;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;

const MAX_ITEM_CHARS: usize = 400;
const MAX_ITEMS: usize = 120;

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryFile {
    items: Vec<String>,
}

fn normalize(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_ITEM_CHARS).collect()
}

async fn load(path: &Path) -> Result<MemoryFile> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(serde_json::from_str(&text).unwrap_or_default()),
        Err(_) => Ok(MemoryFile::default()),
    }
}

async fn save(path: &Path, file: &MemoryFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, serde_json::to_string_pretty(file)?).await?;
    Ok(())
}

/// Read-modify-write the memory file atomically — normalize, de-dup, then
/// drop the oldest entry once the cap is exceeded.
pub async fn update_system_prompt_memory(memory_path: &Path, args: Value) -> Result<Value> {
    let raw = args
        .get("memory")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing required param: memory"))?;
    let normalized = normalize(raw);

    let mut file = load(memory_path).await?;
    if !file.items.iter().any(|existing| existing == &normalized) {
        file.items.push(normalized);
    }
    while file.items.len() > MAX_ITEMS {
        file.items.remove(0);
    }
    save(memory_path, &file).await?;

    Ok(json!({ "items": file.items }))
}

pub async fn list_system_prompt_memory(memory_path: &Path, _args: Value) -> Result<Value> {
    let file = load(memory_path).await?;
    Ok(json!({ "items": file.items }))
}

pub async fn clear_system_prompt_memory(memory_path: &Path, _args: Value) -> Result<Value> {
    save(memory_path, &MemoryFile::default()).await?;
    Ok(json!({ "items": Vec::<String>::new() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_normalizes_dedups_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system-prompt-memory.json");

        update_system_prompt_memory(&path, json!({"memory": "  hello   world  "}))
            .await
            .unwrap();
        let after_dup = update_system_prompt_memory(&path, json!({"memory": "hello world"}))
            .await
            .unwrap();
        assert_eq!(after_dup["items"].as_array().unwrap().len(), 1);

        for i in 0..130 {
            update_system_prompt_memory(&path, json!({"memory": format!("item {i}")}))
                .await
                .unwrap();
        }
        let listed = list_system_prompt_memory(&path, Value::Null).await.unwrap();
        let items = listed["items"].as_array().unwrap();
        assert!(items.len() <= MAX_ITEMS);
    }

    #[tokio::test]
    async fn clear_empties_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system-prompt-memory.json");
        update_system_prompt_memory(&path, json!({"memory": "remember this"}))
            .await
            .unwrap();
        clear_system_prompt_memory(&path, Value::Null).await.unwrap();
        let listed = list_system_prompt_memory(&path, Value::Null).await.unwrap();
        assert!(listed["items"].as_array().unwrap().is_empty());
    }
}
