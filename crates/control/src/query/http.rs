use std::time::Duration;

use async_trait::async_trait;
use common::Output;

use super::{QueryAdapter, QueryContext, QueryOutcome};
use crate::applier::field;
use crate::error::ProbeError;

/// JSON status endpoint exposed by the game server or a sidecar.
pub struct HttpAdapter {
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder().timeout(timeout).build().unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl QueryAdapter for HttpAdapter {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports(&self, query_type: &str) -> bool {
        matches!(query_type, "http" | "json")
    }

    async fn query(&self, ctx: &QueryContext) -> Result<QueryOutcome, ProbeError> {
        let port = ctx.query_port.or(ctx.game_port).ok_or(ProbeError::MissingContext("query port"))?;
        let path = ctx.http_path.as_deref().unwrap_or("/status");
        let url = format!("http://{}:{}{}", ctx.host, port, path);
        let body: Output = self.client.get(&url).send().await?.error_for_status()?.json().await?;
        Ok(QueryOutcome {
            status: field(&body, "status").unwrap_or_else(|| "online".to_string()),
            players: field(&body, "players"),
            max_players: field(&body, "max_players"),
        })
    }
}
