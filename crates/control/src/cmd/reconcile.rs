use std::path::PathBuf;

use chrono::Utc;
use clap::ValueEnum;
use control::reconcile::LoopKind;

use super::util::open_plane;

/// Run one pass of the named loop, or of every loop for `all`, and print the summaries.
pub async fn reconcile(config: Option<PathBuf>, kind: String) -> anyhow::Result<()> {
    let kinds = if kind.eq_ignore_ascii_case("all") {
        LoopKind::ALL.to_vec()
    } else {
        vec![LoopKind::from_str(&kind, true).map_err(|e| anyhow::anyhow!("unknown loop '{kind}': {e}"))?]
    };
    let plane = open_plane(config).await?;
    for kind in kinds {
        let summary = plane.run_pass(kind, Utc::now()).await?;
        println!("{:<10} {summary}", kind.name());
    }
    Ok(())
}
