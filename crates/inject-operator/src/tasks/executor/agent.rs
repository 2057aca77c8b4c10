//! HTTP agent backend
//!
//! Every host runs an agent on a fixed port speaking a JSON envelope
//! `{code, message, data, trace_id}` where code 0 means success.

use super::{
    agent_args, new_trace_id, InjectCommand, QueryResponseData, RemoteExecutor, SubExpInfo,
    VersionInfo, CREATOR,
};
use crate::crds::experiment::PhaseType;
use crate::tasks::config::ExecutorConfig;
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

const SUCCESS_CODE: i64 = 0;

/// Response envelope shared by every agent endpoint
#[derive(Debug, Deserialize)]
struct AgentResponse<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
    #[serde(default)]
    #[allow(dead_code)]
    trace_id: String,
}

impl<T> AgentResponse<T> {
    fn into_result(self) -> Result<Option<T>> {
        if self.code == SUCCESS_CODE {
            Ok(self.data)
        } else {
            Err(Error::RemoteError(format!(
                "err code: {}, err msg: {}",
                self.code, self.message
            )))
        }
    }
}

#[derive(Debug, Serialize)]
struct InjectRequest<'a> {
    target: &'a str,
    fault: &'a str,
    timeout: &'a str,
    creator: &'a str,
    args: String,
    container_id: &'a str,
    container_runtime: &'a str,
    trace_id: String,
    uid: &'a str,
}

#[derive(Debug, Serialize)]
struct RecoverRequest<'a> {
    uid: &'a str,
    trace_id: String,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    uid: &'a str,
    trace_id: String,
}

/// Remote executor talking to the per-host HTTP agent
#[derive(Debug, Clone)]
pub struct AgentExecutor {
    client: reqwest::Client,
    port: u16,
    version: String,
}

impl AgentExecutor {
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        Self::with_port(
            config.agent_config.agent_port,
            &config.version,
            Duration::from_secs(config.agent_config.request_timeout_seconds),
        )
    }

    pub fn with_port(port: u16, version: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            port,
            version: version.to_string(),
        })
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("http://{host}:{}{path}", self.port)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<AgentResponse<T>> {
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| Error::RemoteError(format!("resp[{body}] format error: {e}")))
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        host: &str,
        path: &str,
        body: &B,
    ) -> Result<AgentResponse<T>> {
        let response = self
            .client
            .post(self.url(host, path))
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }
}

#[async_trait]
impl RemoteExecutor for AgentExecutor {
    #[instrument(skip(self))]
    async fn check_alive(&self, host: &str) -> Result<()> {
        let response = self.client.get(self.url(host, "/v1/version")).send().await?;
        let envelope: AgentResponse<VersionInfo> = Self::decode(response).await?;
        let info = envelope
            .into_result()?
            .ok_or_else(|| Error::RemoteError("query version error: empty data".to_string()))?;

        if info.version != self.version {
            return Err(Error::RemoteError(format!(
                "expected version {}, but get {}",
                self.version, info.version
            )));
        }

        debug!(host = %host, version = %info.version, "Agent is alive");
        Ok(())
    }

    #[instrument(
        skip(self, command),
        fields(uid = %command.uid, target = %command.target, fault = %command.fault)
    )]
    async fn inject(&self, host: &str, command: &InjectCommand) -> Result<()> {
        self.check_alive(host).await?;

        let args = serde_json::to_string(&agent_args(&command.args)?)?;
        let request = InjectRequest {
            target: &command.target,
            fault: &command.fault,
            timeout: &command.timeout,
            creator: CREATOR,
            args,
            container_id: &command.container_id,
            container_runtime: &command.container_runtime,
            trace_id: new_trace_id(),
            uid: &command.uid,
        };

        let envelope: AgentResponse<serde_json::Value> =
            self.post(host, "/v1/experiment/inject", &request).await?;
        envelope.into_result()?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recover(&self, host: &str, uid: &str) -> Result<()> {
        let request = RecoverRequest {
            uid,
            trace_id: new_trace_id(),
        };

        let envelope: AgentResponse<serde_json::Value> =
            self.post(host, "/v1/experiment/recover", &request).await?;
        envelope.into_result()?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn query(&self, host: &str, uid: &str, phase: PhaseType) -> Result<SubExpInfo> {
        let request = QueryRequest {
            uid,
            trace_id: new_trace_id(),
        };

        let envelope: AgentResponse<QueryResponseData> =
            self.post(host, "/v1/experiment/query", &request).await?;
        let data = envelope.into_result()?.unwrap_or_default();

        match data.experiments.into_iter().next() {
            Some(task) if data.total > 0 => Ok(task.into_sub_exp(uid, phase)),
            _ => Err(Error::NotFound(format!("task {uid}"))),
        }
    }
}
