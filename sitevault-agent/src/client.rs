//! HTTP client for a running agent, used by the `control` and `status`
//! commands.

use reqwest::Response;
use serde_json::{json, Value};
use sitevault_core::status::{ControlAction, ProgressRecord};
use std::time::Duration;

use crate::utils::{AgentError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AgentClient {
    base: String,
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn control(&self, action: ControlAction) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/control", self.base))
            .json(&json!({ "action": action }))
            .send()
            .await?;
        Ok(checked(resp).await?.json().await?)
    }

    pub async fn progress(&self) -> Result<ProgressRecord> {
        let resp = self.http.get(format!("{}/progress", self.base)).send().await?;
        Ok(checked(resp).await?.json().await?)
    }
}

/// Turn a non-2xx answer into [`AgentError::Remote`] carrying its `error` field.
async fn checked(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| status.to_string());
    Err(AgentError::Remote {
        status: status.as_u16(),
        message,
    })
}
