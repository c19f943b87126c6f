use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use super::util::open_plane;

/// Run the API and every reconcile loop until `shutdown` resolves.
pub async fn serve(config: Option<PathBuf>, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    let plane = Arc::new(open_plane(config).await?);
    info!(data_dir = %plane.config.data_dir.display(), "control plane starting");
    let loops = plane.spawn_loops();
    let result = control::web::serve(plane, shutdown).await;
    for handle in loops {
        handle.abort();
    }
    info!("control plane stopped");
    result
}
