use std::path::PathBuf;

use super::util::open_plane;

pub async fn audit(config: Option<PathBuf>, limit: usize, verify: bool) -> anyhow::Result<()> {
    let plane = open_plane(config).await?;
    for ev in plane.audit.recent(limit).await {
        let detail = serde_json::to_string(&ev.detail)?;
        println!("{}  {:<22} {}", ev.at.format("%Y-%m-%d %H:%M:%S"), ev.event, detail);
    }
    if verify {
        match plane.audit.verify().await {
            Ok(()) => println!("chain ok"),
            Err(index) => anyhow::bail!("audit chain broken at event #{index}"),
        }
    }
    Ok(())
}
