use std::path::PathBuf;

use chrono::Utc;
use common::{Job, JobStatus};

use super::util::{open_plane, parse_params};

fn print_job_line(job: &Job) {
    println!(
        "{}  {:<10} {:<28} agent={} attempts={} created={}",
        job.id,
        job.status.to_string(),
        job.job_type,
        job.agent_id.as_deref().unwrap_or("-"),
        job.attempts,
        job.created_at.format("%Y-%m-%d %H:%M:%S"),
    );
}

pub async fn dispatch(
    config: Option<PathBuf>,
    agent: String,
    job_type: String,
    params: Vec<String>,
    log_failures: bool,
) -> anyhow::Result<()> {
    let plane = open_plane(config).await?;
    let payload = parse_params(&params)?;
    let now = Utc::now();
    let job = if log_failures {
        plane.dispatcher.dispatch_with_failure_logging(&agent, &job_type, payload, now).await?
    } else {
        plane.dispatcher.dispatch(&agent, &job_type, payload, now).await?
    };
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

pub async fn list_jobs(config: Option<PathBuf>, status: Option<String>, limit: usize) -> anyhow::Result<()> {
    let plane = open_plane(config).await?;
    let status = status.map(|s| s.parse::<JobStatus>()).transpose()?;
    let jobs = plane.store.list(status, limit).await;
    if jobs.is_empty() {
        println!("no jobs");
    }
    for job in &jobs {
        print_job_line(job);
    }
    Ok(())
}

pub async fn job_status(config: Option<PathBuf>, id: String) -> anyhow::Result<()> {
    let plane = open_plane(config).await?;
    match plane.store.get(&id).await {
        Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
        None => anyhow::bail!("job {id} not found"),
    }
    Ok(())
}

pub async fn cancel_job(config: Option<PathBuf>, id: String) -> anyhow::Result<()> {
    let plane = open_plane(config).await?;
    if plane.dispatcher.cancel(&id, Utc::now()).await? {
        println!("cancelled {id}");
    } else {
        println!("{id} is not queued; left unchanged");
    }
    Ok(())
}
