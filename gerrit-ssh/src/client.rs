//! High-level Gerrit requests on top of the transport machines.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::GerritError;
use crate::io::agent::{AgentHandle, AgentSupervisor};
use crate::io::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::io::config::{COMMAND_CLASS, ClientConfig, FEED_CLASS};
use crate::io::event_stream::{EventStream, EventSubscription};
use crate::io::transport::Target;

/// Body of `gerrit review --json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReviewInput {
    pub message: String,
    pub labels: BTreeMap<String, i32>,
    /// Inline comments keyed by file path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<BTreeMap<String, Vec<ReviewComment>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewComment {
    pub path: String,
    pub line: u32,
    pub message: String,
}

/// Connection to one Gerrit server through a private `ssh-agent`.
///
/// Dropping the client shuts its agent down.
pub struct GerritClient {
    config: ClientConfig,
    target: Target,
    agent: AgentHandle,
    agent_shutdown: CancellationToken,
    agent_task: Option<JoinHandle<Result<(), GerritError>>>,
    shutdown: CancellationToken,
}

impl GerritClient {
    /// Start the agent, load the configured key and check the link with
    /// `gerrit version`. On failure the agent has exited before this returns.
    pub async fn connect(
        config: ClientConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, GerritError> {
        config
            .validate_target()
            .map_err(|err| GerritError::invalid_request(format!("{err:#}")))?;
        let agent_shutdown = shutdown.child_token();
        let (agent, agent_task) =
            AgentSupervisor::start(config.transport.clone(), agent_shutdown.clone());
        let client = Self {
            target: Target::from_config(&config),
            config,
            agent,
            agent_shutdown,
            agent_task: Some(agent_task),
            shutdown,
        };

        match client.handshake().await {
            Ok(version) => {
                info!(
                    host = %client.target.host,
                    port = client.target.port,
                    version = %version,
                    "connected to gerrit"
                );
                Ok(client)
            }
            Err(err) => {
                if let Err(close_err) = client.close().await {
                    warn!(error = %close_err, "agent stopped with an error");
                }
                Err(err)
            }
        }
    }

    async fn handshake(&self) -> Result<String, GerritError> {
        self.agent.wait_running().await?;
        if let Some(key) = &self.config.key_file {
            self.agent.signing_client()?.add_key(key).await?;
        }
        self.version().await
    }

    pub fn agent(&self) -> &AgentHandle {
        &self.agent
    }

    /// Runner for `gerrit <args...>` with this client's command recovery
    /// class.
    pub fn runner(&self, args: Vec<String>) -> CommandRunner {
        let spec = CommandSpec::new(self.target.clone(), self.config.transport.clone(), args);
        self.runner_for(spec)
    }

    fn runner_for(&self, spec: CommandSpec) -> CommandRunner {
        let policy = self.config.recovery_for(COMMAND_CLASS).policy();
        CommandRunner::new(spec, self.agent.clone(), policy, self.shutdown.clone())
    }

    /// Server version, e.g. `2.14.6`.
    pub async fn version(&self) -> Result<String, GerritError> {
        let output = self.runner(vec!["version".to_string()]).run().await?;
        Ok(output.stdout.trim().to_string())
    }

    /// Run `gerrit query` and decode one JSON record per output line.
    pub async fn query(&self, query: &str, fields: &[String]) -> Result<Vec<Value>, GerritError> {
        let args = query_args(query, fields)?;
        let output = self.runner(args).run().await?;
        parse_json_lines(&output)
    }

    /// Post a review on `revision` (a commit sha or `change,patchset`).
    pub async fn review(
        &self,
        revision: &str,
        project: Option<&str>,
        input: &ReviewInput,
    ) -> Result<String, GerritError> {
        let args = review_args(revision, project)?;
        let body = serde_json::to_vec(input)
            .map_err(|err| GerritError::invalid_request(format!("encode review: {err}")))?;
        let spec = CommandSpec::new(self.target.clone(), self.config.transport.clone(), args)
            .with_body(body);
        let output = self.runner_for(spec).run().await?;
        Ok(output.stdout.trim().to_string())
    }

    /// Subscribe to `gerrit stream-events`.
    pub fn event_stream(&self) -> EventSubscription {
        let policy = self.config.recovery_for(FEED_CLASS).policy();
        EventStream::new(
            self.target.clone(),
            self.config.transport.clone(),
            self.agent.clone(),
            policy,
            self.shutdown.clone(),
        )
        .start()
    }

    /// Stop the agent and wait for it to exit.
    pub async fn close(mut self) -> Result<(), GerritError> {
        self.agent_shutdown.cancel();
        match self.agent_task.take() {
            Some(task) => task.await.map_err(|err| {
                error!(error = %err, "agent task failed");
                GerritError::agent(format!("agent task failed: {err}"))
            })?,
            None => Ok(()),
        }
    }
}

impl Drop for GerritClient {
    fn drop(&mut self) {
        self.agent_shutdown.cancel();
    }
}

/// Arguments for `gerrit query --format json`.
pub fn query_args(query: &str, fields: &[String]) -> Result<Vec<String>, GerritError> {
    let terms: Vec<&str> = query.split_whitespace().collect();
    if terms.is_empty() {
        return Err(GerritError::invalid_request("query must not be empty"));
    }
    let mut args = vec!["query".to_string(), "--format".to_string(), "json".to_string()];
    for field in fields {
        let field = field.trim_start_matches("--");
        if field.is_empty() || field.contains(char::is_whitespace) {
            return Err(GerritError::invalid_request(format!(
                "invalid query field {field:?}"
            )));
        }
        args.push(format!("--{field}"));
    }
    args.push("--".to_string());
    args.extend(terms.into_iter().map(str::to_string));
    Ok(args)
}

/// Arguments for `gerrit review <revision> --json`.
pub fn review_args(revision: &str, project: Option<&str>) -> Result<Vec<String>, GerritError> {
    static REVISION: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^([a-fA-F0-9]+|[0-9]+,[0-9]+)$").expect("valid regex")
    });
    if !REVISION.is_match(revision) {
        return Err(GerritError::invalid_request(format!(
            "{revision:?} is neither a commit sha nor change,patchset"
        )));
    }
    let mut args = vec![
        "review".to_string(),
        revision.to_string(),
        "--json".to_string(),
    ];
    if let Some(project) = project {
        args.push("--project".to_string());
        args.push(project.to_string());
    }
    Ok(args)
}

fn parse_json_lines(output: &CommandOutput) -> Result<Vec<Value>, GerritError> {
    output
        .stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|err| GerritError::protocol(format!("unparseable query line: {err}")))
        })
        .collect()
}
