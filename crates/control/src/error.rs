use common::JobStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {id} is {actual}, expected {expected}")]
    InvalidTransition {
        id: String,
        actual: JobStatus,
        expected: JobStatus,
    },

    #[error("Job {id} is not addressed to agent {agent_id}")]
    WrongAgent { id: String, agent_id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{job_type} rejected: {}", errors.join("; "))]
    Validation { job_type: String, errors: Vec<String> },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The job row was updated but the inventory write that follows failed.
    #[error("Result for job {job_id} recorded but not applied: {source}")]
    Apply {
        job_id: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Probe timed out after {0} ms")]
    Timeout(u64),

    #[error("Missing query context: {0}")]
    MissingContext(&'static str),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("RCON authentication rejected")]
    AuthRejected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}
