use std::path::PathBuf;

use anyhow::Context;
use common::Payload;
use control::{ControlConfig, ControlPlane};
use serde_json::Value;

pub async fn open_plane(config: Option<PathBuf>) -> anyhow::Result<ControlPlane> {
    let config = ControlConfig::load(config.as_deref()).context("load config")?;
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
    Ok(ControlPlane::open(config).await?)
}

/// `key=value` pairs into a payload. Values that parse as JSON keep their type,
/// so `port=27015` is a number and `name=alpha` stays a string.
pub fn parse_params(params: &[String]) -> anyhow::Result<Payload> {
    let mut payload = Payload::new();
    for p in params {
        let (key, raw) = p
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid param '{p}', expected key=value"))?;
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        payload.insert(key.trim().to_string(), value);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_keep_json_types() {
        let p = parse_params(&["port=27015".into(), "name=alpha".into(), "ports=[1,2]".into()]).unwrap();
        assert_eq!(p["port"], json!(27015));
        assert_eq!(p["name"], json!("alpha"));
        assert_eq!(p["ports"], json!([1, 2]));
        assert!(parse_params(&["novalue".into()]).is_err());
    }
}
