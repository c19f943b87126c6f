use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::StoreError;

/// Read a JSON snapshot; `None` when the file does not exist yet.
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a JSON snapshot through a temp file so readers never see a torn file.
pub async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
