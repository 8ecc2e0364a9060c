// SPDX-License-Identifier: Apache-2.0

//! Agent: the thin lifecycle wrapper composing the database, the plugin
//! template directory and the pipeline.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::operator::{default_registry, BuildContext, Registry};
use crate::persistence::Database;
use crate::pipeline::Pipeline;
use crate::plugin::TemplateSet;

/// The agent's parsed configuration: where the offset database lives and
/// the pipeline document. Configuration file discovery and parsing belong
/// to the host; this type only carries the result.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Filesystem path of the offset database. When absent the agent runs
    /// with an in-memory database and persists nothing.
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// The pipeline document: a sequence of operator descriptors
    #[serde(default)]
    pub pipeline: serde_yaml::Value,
}

impl Config {
    /// Parse a configuration document from YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

pub struct Agent {
    config: Config,
    plugin_dir: Option<PathBuf>,
    registry: Registry,
    database: Option<Database>,
    pipeline: Option<Pipeline>,
    running: bool,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            plugin_dir: None,
            registry: default_registry().clone(),
            database: None,
            pipeline: None,
            running: false,
        }
    }

    /// Directory of plugin template files; the file stem becomes the
    /// plugin's type name
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = Some(dir.into());
        self
    }

    /// Replace the operator registry, e.g. with a hermetic one in tests
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// The open database, available while the agent is running
    pub fn database(&self) -> Option<&Database> {
        self.database.as_ref()
    }

    /// Open the database, load plugin templates, build the pipeline and
    /// start it. The returned error names the first failing stage.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }

        let database = match &self.config.database {
            Some(path) => Database::open(path).map_err(|e| e.in_stage("open database"))?,
            None => Database::open_in_memory(),
        };

        let templates = match &self.plugin_dir {
            Some(dir) => match TemplateSet::load_dir(dir) {
                Ok(templates) => templates,
                Err(e) => {
                    warn!(error = %e, "failed to load plugin templates, continuing without them");
                    TemplateSet::default()
                }
            },
            None => TemplateSet::default(),
        };

        let mut context = BuildContext::new(database.clone()).with_templates(templates);
        let mut pipeline = Pipeline::build(&self.config.pipeline, &self.registry, &mut context)
            .map_err(|e| e.in_stage("build pipeline"))?;

        pipeline
            .start()
            .await
            .map_err(|e| e.in_stage("start pipeline"))?;

        self.database = Some(database);
        self.pipeline = Some(pipeline);
        self.running = true;
        info!("agent started");
        Ok(())
    }

    /// Stop the pipeline and flush the database. Infallible; sub-errors
    /// are logged.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }

        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.stop().await;
        }

        if let Some(database) = self.database.take() {
            if let Err(e) = database.flush() {
                warn!(error = %e, "failed to flush database on stop");
            }
        }

        self.running = false;
        info!("agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_start_stop() {
        let config = Config::from_yaml(
            "\
pipeline:
  - type: noop
  - type: stdout
",
        )
        .unwrap();

        let mut agent = Agent::new(config);
        agent.start().await.unwrap();
        // Second start is a no-op while running
        agent.start().await.unwrap();
        agent.stop().await;
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_start_names_failing_stage() {
        let config = Config::from_yaml("pipeline:\n  - type: mystery_op\n").unwrap();
        let mut agent = Agent::new(config);
        let err = agent.start().await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("build pipeline:"), "{}", message);
        assert!(message.contains("unknown operator type"), "{}", message);
    }
}
