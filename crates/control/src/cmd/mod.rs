pub mod audit;
pub mod job;
pub mod reconcile;
pub mod serve;
pub mod util;

pub use audit::audit;
pub use job::{cancel_job, dispatch, job_status, list_jobs};
pub use reconcile::reconcile;
pub use serve::serve;
